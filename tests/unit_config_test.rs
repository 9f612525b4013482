use timbre::config::Config;

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.port, 64738);
    assert_eq!(config.max_users, 100);
    assert_eq!(config.max_bandwidth, 72_000);
    assert_eq!(config.persistence.snapshot_ops, 100);
    assert!(config.allow_html);
    assert!(config.super_user_password.is_empty());
    assert!(!config.registration_enabled());
    config.validate().unwrap();
}

#[test]
fn test_parse_minimal_toml() {
    let raw = r#"
        port = 1234
        max_users = 10
        welcome_text = "hi"

        [tls]
        cert_path = "/etc/timbre/cert.pem"
        key_path = "/etc/timbre/key.pem"
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    assert_eq!(config.port, 1234);
    assert_eq!(config.max_users, 10);
    assert_eq!(config.welcome_text, "hi");
    assert_eq!(config.tls.cert_path, "/etc/timbre/cert.pem");
    // Unset sections keep their defaults.
    assert_eq!(config.max_bandwidth, 72_000);
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = Config::default();
    config.port = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.max_users = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.persistence.snapshot_ops = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_typed_key_accessors() {
    let mut config = Config::default();
    config.set_key("MaxUsers", "55").unwrap();
    config.set_key("AllowHTML", "false").unwrap();
    config.set_key("WelcomeText", "yo").unwrap();
    config.set_key("Port", "2000").unwrap();

    assert_eq!(config.max_users, 55);
    assert!(!config.allow_html);
    assert_eq!(config.get_key("MaxUsers").as_deref(), Some("55"));
    assert_eq!(config.get_key("AllowHTML").as_deref(), Some("false"));
    assert_eq!(config.get_key("WelcomeText").as_deref(), Some("yo"));
    assert_eq!(config.get_key("Port").as_deref(), Some("2000"));

    assert!(config.set_key("MaxUsers", "not-a-number").is_err());
    assert!(config.set_key("NoSuchKey", "1").is_err());
    assert_eq!(config.get_key("NoSuchKey"), None);
}

#[test]
fn test_data_paths_derive_from_data_dir() {
    let mut config = Config::default();
    config.data_dir = "/var/lib/timbre".into();
    assert_eq!(
        config.snapshot_path().to_string_lossy(),
        "/var/lib/timbre/timbre.snapshot"
    );
    assert_eq!(
        config.log_path().to_string_lossy(),
        "/var/lib/timbre/timbre.oplog"
    );
}
