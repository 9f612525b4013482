use timbre::core::channel::{ChannelTree, ROOT_ID};

#[test]
fn test_new_tree_has_root_only() {
    let tree = ChannelTree::new();
    assert_eq!(tree.len(), 1);
    let root = tree.get(ROOT_ID).unwrap();
    assert!(root.is_root());
    assert_eq!(root.parent, None);
}

#[test]
fn test_add_links_parent_and_child() {
    let mut tree = ChannelTree::new();
    let id = tree.add(ROOT_ID, "General", false).unwrap();
    assert!(tree.get(ROOT_ID).unwrap().children.contains(&id));
    assert_eq!(tree.get(id).unwrap().parent, Some(ROOT_ID));
    assert_eq!(tree.chain(id).unwrap(), vec![ROOT_ID, id]);
}

#[test]
fn test_link_is_symmetric_and_unlink_idempotent() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(ROOT_ID, "b", false).unwrap();
    tree.link(a, b).unwrap();
    assert!(tree.get(a).unwrap().links.contains(&b));
    assert!(tree.get(b).unwrap().links.contains(&a));

    tree.unlink(a, b);
    tree.unlink(a, b);
    assert!(tree.get(a).unwrap().links.is_empty());
    assert!(tree.get(b).unwrap().links.is_empty());
}

#[test]
fn test_self_link_is_a_no_op() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    tree.link(a, a).unwrap();
    assert!(tree.get(a).unwrap().links.is_empty());
}

#[test]
fn test_move_rejects_cycles_and_root() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(a, "b", false).unwrap();

    assert!(tree.move_channel(a, b).is_err());
    assert!(tree.move_channel(a, a).is_err());
    assert!(tree.move_channel(ROOT_ID, a).is_err());

    let c = tree.add(ROOT_ID, "c", false).unwrap();
    tree.move_channel(b, c).unwrap();
    assert_eq!(tree.get(b).unwrap().parent, Some(c));
    assert!(!tree.get(a).unwrap().children.contains(&b));
}

#[test]
fn test_remove_leaf_refuses_root_and_parents() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(a, "b", false).unwrap();

    assert!(tree.remove_leaf(ROOT_ID).is_err());
    assert!(tree.remove_leaf(a).is_err());

    tree.remove_leaf(b).unwrap();
    assert!(tree.remove_leaf(a).is_ok());
    assert_eq!(tree.len(), 1);
}

#[test]
fn test_remove_leaf_severs_links_on_both_sides() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(ROOT_ID, "b", false).unwrap();
    tree.link(a, b).unwrap();

    tree.remove_leaf(a).unwrap();
    assert!(tree.get(b).unwrap().links.is_empty());
}

#[test]
fn test_removed_channel_ids_are_not_reused() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    tree.remove_leaf(a).unwrap();
    let b = tree.add(ROOT_ID, "b", false).unwrap();
    assert!(b > a);
}

#[test]
fn test_walk_yields_parents_before_children() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(a, "b", false).unwrap();
    let c = tree.add(ROOT_ID, "c", false).unwrap();

    let order = tree.walk();
    let pos = |id: u32| order.iter().position(|x| *x == id).unwrap();
    assert_eq!(order[0], ROOT_ID);
    assert!(pos(a) < pos(b));
    assert!(pos(c) > pos(ROOT_ID));
    assert_eq!(order.len(), 4);
}

#[test]
fn test_subtree_postorder_is_deepest_first() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    let b = tree.add(a, "b", false).unwrap();
    let c = tree.add(b, "c", false).unwrap();

    let order = tree.subtree_postorder(a);
    assert_eq!(order, vec![c, b, a]);
}

#[test]
fn test_member_moves() {
    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    tree.move_member(7, None, Some(ROOT_ID));
    assert!(tree.get(ROOT_ID).unwrap().members.contains(&7));

    tree.move_member(7, Some(ROOT_ID), Some(a));
    assert!(!tree.get(ROOT_ID).unwrap().members.contains(&7));
    assert!(tree.get(a).unwrap().members.contains(&7));

    tree.move_member(7, Some(a), None);
    assert!(tree.get(a).unwrap().members.is_empty());
}

#[test]
fn test_purge_user_strips_acls_and_groups() {
    use timbre::core::channel::{AclEntry, Group};

    let mut tree = ChannelTree::new();
    let a = tree.add(ROOT_ID, "a", false).unwrap();
    {
        let channel = tree.get_mut(a).unwrap();
        channel.acls.push(AclEntry {
            apply_here: true,
            apply_subs: false,
            user_id: Some(9),
            group: None,
            grant: 0x4,
            deny: 0,
        });
        let mut group = Group {
            name: "ops".into(),
            ..Group::default()
        };
        group.add.insert(9);
        group.remove.insert(9);
        group.temporary.insert(9);
        channel.groups.insert("ops".into(), group);
    }

    tree.purge_user(9);
    let channel = tree.get(a).unwrap();
    assert!(channel.acls.is_empty());
    let group = channel.groups.get("ops").unwrap();
    assert!(group.add.is_empty());
    assert!(group.remove.is_empty());
    assert!(group.temporary.is_empty());
}
