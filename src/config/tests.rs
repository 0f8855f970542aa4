use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("sqlite://file.db".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = GlobalOverrides {
        database_url: Some("postgres://db/blog".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.database.url.as_deref(), Some("postgres://db/blog"));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_applied() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(
        settings.database.max_connections.get(),
        DEFAULT_DB_MAX_CONNECTIONS
    );
    assert_eq!(settings.database.acquire_timeout, Duration::from_secs(30));
    assert!(settings.database.url.is_none());
    assert!(settings.cache.regions.is_empty());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn blank_database_url_is_treated_as_missing() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn explicit_backend_must_match_url_scheme() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("mysql://root@db/blog".to_string());
    raw.database.backend = Some("postgres".to_string());

    let err = Settings::from_raw(raw).expect_err("mismatch");
    assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "database.backend"));
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.database.backend = Some("oracle".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_pool_size_is_rejected() {
    let mut raw = RawSettings::default();
    raw.database.max_connections = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero pool");
    assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "database.max_connections"));
}

#[test]
fn cache_regions_are_normalized_and_validated() {
    let mut raw = RawSettings::default();
    raw.cache.regions.insert("Post".to_string(), 10);
    raw.cache.regions.insert("feed".to_string(), 60);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.regions.get("post").map(|m| m.get()), Some(10));
    assert_eq!(settings.cache.regions.get("feed").map(|m| m.get()), Some(60));

    let mut raw = RawSettings::default();
    raw.cache.regions.insert("menu".to_string(), 0);
    let err = Settings::from_raw(raw).expect_err("zero minutes");
    assert!(matches!(err, LoadError::Invalid { ref key, .. } if key == "cache.regions.menu"));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn parse_global_flags_after_subcommand() {
    let args = CliArgs::parse_from([
        "scriptorium",
        "warm",
        "--database-url",
        "sqlite://blog.db",
        "--database-backend",
        "sqlite",
    ]);

    assert_eq!(args.command, Some(Command::Warm));
    assert_eq!(args.overrides.database_url.as_deref(), Some("sqlite://blog.db"));
    assert_eq!(args.overrides.database_backend, Some(DbBackend::Sqlite));
}

#[test]
fn missing_subcommand_parses() {
    let args = CliArgs::parse_from(["scriptorium"]);
    assert!(args.command.is_none());
}
