use timbre::core::users::{
    SUPER_USER_ID, UserRegistry, hash_super_user_password, verify_super_user_password,
};

#[test]
fn test_register_assigns_increasing_ids_above_super_user() {
    let mut registry = UserRegistry::new();
    let a = registry.register("alice", "digest-a").unwrap();
    let b = registry.register("bob", "digest-b").unwrap();
    assert!(a > SUPER_USER_ID);
    assert_eq!(b, a + 1);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_registration_requires_certificate_and_unique_name() {
    let mut registry = UserRegistry::new();
    assert!(registry.register("alice", "").is_err());
    registry.register("alice", "digest-a").unwrap();
    assert!(registry.register("alice", "digest-b").is_err());
}

#[test]
fn test_lookup_by_name_and_digest() {
    let mut registry = UserRegistry::new();
    let id = registry.register("alice", "digest-a").unwrap();
    assert_eq!(registry.find_by_name("alice").unwrap().id, id);
    assert_eq!(registry.find_by_digest("digest-a").unwrap().id, id);
    assert!(registry.find_by_name("bob").is_none());
    assert!(registry.find_by_digest("").is_none());
}

#[test]
fn test_rename_keeps_indexes_consistent() {
    let mut registry = UserRegistry::new();
    let a = registry.register("alice", "digest-a").unwrap();
    registry.register("bob", "digest-b").unwrap();

    assert!(registry.rename(a, "bob").is_err());
    registry.rename(a, "allie").unwrap();
    assert!(registry.find_by_name("alice").is_none());
    assert_eq!(registry.find_by_name("allie").unwrap().id, a);
    // Renaming to the current name is fine.
    registry.rename(a, "allie").unwrap();
}

#[test]
fn test_remove_clears_indexes_and_ids_are_not_reused() {
    let mut registry = UserRegistry::new();
    let a = registry.register("alice", "digest-a").unwrap();
    registry.remove(a).unwrap();
    assert!(registry.find_by_name("alice").is_none());
    assert!(registry.find_by_digest("digest-a").is_none());

    let b = registry.register("bob", "digest-b").unwrap();
    assert!(b > a);
}

#[test]
fn test_snapshot_and_restore() {
    let mut registry = UserRegistry::new();
    registry.register("alice", "digest-a").unwrap();
    registry.register("bob", "digest-b").unwrap();

    let restored = UserRegistry::from_users(registry.snapshot_users());
    assert_eq!(restored.len(), 2);
    assert!(restored.find_by_name("alice").is_some());
    let c = {
        let mut restored = restored;
        restored.register("carol", "digest-c").unwrap()
    };
    assert_eq!(c, 3);
}

#[test]
fn test_super_user_password_record_format() {
    let record = hash_super_user_password("hunter2").unwrap();
    let parts: Vec<&str> = record.split('$').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "sha1");
    // 24 salt bytes, hex-encoded.
    assert_eq!(parts[1].len(), 48);
    // SHA-1 digest, hex-encoded.
    assert_eq!(parts[2].len(), 40);
}

#[test]
fn test_super_user_password_verification() {
    let record = hash_super_user_password("hunter2").unwrap();
    assert!(verify_super_user_password(&record, "hunter2"));
    assert!(!verify_super_user_password(&record, "hunter3"));
    assert!(!verify_super_user_password("", "hunter2"));
    assert!(!verify_super_user_password("md5$aa$bb", "hunter2"));
    assert!(!verify_super_user_password("sha1$zz$zz", "hunter2"));

    // Salting makes records unique per invocation.
    let other = hash_super_user_password("hunter2").unwrap();
    assert_ne!(record, other);
    assert!(verify_super_user_password(&other, "hunter2"));
}
