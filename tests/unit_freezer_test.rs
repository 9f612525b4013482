use tempfile::TempDir;
use timbre::core::channel::ChannelTree;
use timbre::core::persistence::{Freezer, FreezerOp, ServerImage, snapshot};
use timbre::core::users::User;

fn channel_record(tree: &mut ChannelTree, name: &str) -> timbre::core::channel::Channel {
    let id = tree.add(0, name, false).unwrap();
    tree.get(id).unwrap().clone()
}

fn user_record(id: u32, name: &str) -> User {
    User {
        id,
        name: name.into(),
        cert_digest: format!("digest-{id}"),
        email: String::new(),
        texture_hash: None,
        comment_hash: None,
        last_channel: 0,
        last_seen: None,
    }
}

#[tokio::test]
async fn test_snapshot_roundtrip_with_checksum() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.snapshot");

    let mut tree = ChannelTree::new();
    channel_record(&mut tree, "General");
    let image = ServerImage {
        server_id: 1,
        next_channel_id: tree.peek_next_id(),
        channels: tree.snapshot_channels(),
        users: vec![user_record(1, "alice")],
        bans: vec![],
        config_overrides: Default::default(),
    };

    snapshot::save(&image, &path).await.unwrap();
    let loaded = snapshot::load(&path).await.unwrap().unwrap();
    assert_eq!(loaded.channels.len(), 2);
    assert_eq!(loaded.users[0].name, "alice");
    assert_eq!(loaded.next_channel_id, image.next_channel_id);
}

#[tokio::test]
async fn test_missing_snapshot_is_none_and_corruption_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.snapshot");
    assert!(snapshot::load(&path).await.unwrap().is_none());

    tokio::fs::write(&path, b"{\"server_id\":1}\n0000000000000000\n")
        .await
        .unwrap();
    assert!(snapshot::load(&path).await.is_err());
}

#[tokio::test]
async fn test_log_replay_over_snapshot() {
    let dir = TempDir::new().unwrap();
    let snapshot_path = dir.path().join("image.snapshot");
    let log_path = dir.path().join("ops.log");

    // First run: two ops, no snapshot file yet.
    {
        let (mut freezer, _image) = Freezer::open(snapshot_path.clone(), log_path.clone(), 100)
            .await
            .unwrap();
        let mut tree = ChannelTree::new();
        let channel = channel_record(&mut tree, "General");
        freezer
            .append(&FreezerOp::ChannelUpsert { channel })
            .await
            .unwrap();
        freezer
            .append(&FreezerOp::UserUpsert {
                user: user_record(1, "alice"),
            })
            .await
            .unwrap();
        freezer
            .append(&FreezerOp::ConfigSet {
                key: "WelcomeText".into(),
                value: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(freezer.ops_since_snapshot(), 3);
    }

    // Second run replays the log into the boot image.
    let (_freezer, image) = Freezer::open(snapshot_path.clone(), log_path.clone(), 100)
        .await
        .unwrap();
    assert_eq!(image.channels.len(), 1);
    assert_eq!(image.channels[0].name, "General");
    assert_eq!(image.users.len(), 1);
    assert_eq!(
        image.config_overrides.get("WelcomeText").map(String::as_str),
        Some("hello")
    );
    // Replay folds into a fresh snapshot.
    assert!(snapshot::load(&snapshot_path).await.unwrap().is_some());
}

#[tokio::test]
async fn test_snapshot_due_and_reset() {
    let dir = TempDir::new().unwrap();
    let (mut freezer, image) = Freezer::open(
        dir.path().join("image.snapshot"),
        dir.path().join("ops.log"),
        3,
    )
    .await
    .unwrap();

    for i in 0..3 {
        assert!(!freezer.snapshot_due());
        freezer
            .append(&FreezerOp::ConfigSet {
                key: "MaxUsers".into(),
                value: i.to_string(),
            })
            .await
            .unwrap();
    }
    assert!(freezer.snapshot_due());

    freezer.snapshot(&image).await.unwrap();
    assert!(!freezer.snapshot_due());
    assert_eq!(freezer.ops_since_snapshot(), 0);
}

#[tokio::test]
async fn test_torn_trailing_op_is_skipped() {
    let dir = TempDir::new().unwrap();
    let snapshot_path = dir.path().join("image.snapshot");
    let log_path = dir.path().join("ops.log");

    let good = serde_json::to_string(&FreezerOp::ConfigSet {
        key: "WelcomeText".into(),
        value: "hi".into(),
    })
    .unwrap();
    tokio::fs::write(&log_path, format!("{good}\n{{\"op\":\"conf"))
        .await
        .unwrap();

    let (_freezer, image) = Freezer::open(snapshot_path, log_path, 100).await.unwrap();
    assert_eq!(
        image.config_overrides.get("WelcomeText").map(String::as_str),
        Some("hi")
    );
}

#[tokio::test]
async fn test_channel_remove_scrubs_references() {
    let mut image = ServerImage::default();
    let mut tree = ChannelTree::new();
    let a = tree.add(0, "a", false).unwrap();
    let b = tree.add(0, "b", false).unwrap();
    tree.link(a, b).unwrap();
    for channel in tree.snapshot_channels() {
        image.upsert_channel(channel);
    }

    FreezerOp::ChannelRemove { id: a }.apply(&mut image);
    assert!(image.channels.iter().all(|c| c.id != a));
    let b_record = image.channels.iter().find(|c| c.id == b).unwrap();
    assert!(b_record.links.is_empty());
    let root = image.channels.iter().find(|c| c.id == 0).unwrap();
    assert!(!root.children.contains(&a));
}
