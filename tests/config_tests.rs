use astro_supervisor::config::{ChannelConfig, Config, UnmatchedPolicy, validate_config};
use astro_supervisor::error::{Error, Result};
use astro_supervisor::event::EventKind;
use std::io::Write;

#[test]
fn test_parse_full_config() -> Result<()> {
    let config_str = r#"{
        "server": {
            "executable": "AstroneerServer/AstroServer.exe",
            "args": ["-log"],
            "name": "Test Server",
            "compat": { "prefix": "winepfx", "env": { "WINEDEBUG": "fixme-all" } }
        },
        "supervisor": { "autoRestart": true, "maxRestarts": 5, "shutdownGraceSecs": 10 },
        "classifier": {
            "unmatched": "message",
            "patterns": [{ "kind": "save", "regex": "LogSaveGame" }]
        },
        "notifications": {
            "whitelist": ["crash", "player_join"],
            "channels": [
                { "kind": "discord", "url": "https://discord.com/api/webhooks/1/abc" },
                { "kind": "ntfy", "topic": "astro" },
                { "kind": "none" }
            ]
        },
        "status": { "url": "https://status.example.com/push?token=x" },
        "network": { "publicIp": "203.0.113.7", "overwritePublicIp": true }
    }"#;

    let config = Config::parse_from_str(config_str)?;

    assert_eq!(config.server.args, vec!["-log"]);
    let compat = config.server.compat.as_ref().unwrap();
    assert_eq!(compat.executable, "wine");
    assert_eq!(compat.env.get("WINEDEBUG"), Some(&"fixme-all".to_string()));

    assert!(config.supervisor.auto_restart);
    assert_eq!(config.supervisor.max_restarts, 5);
    assert_eq!(config.supervisor.shutdown_grace_secs, 10);
    assert_eq!(config.supervisor.start_timeout_secs, 120);

    assert_eq!(config.classifier.unmatched, UnmatchedPolicy::Message);
    assert_eq!(config.classifier.patterns[0].kind, EventKind::Save);

    let whitelist: Vec<_> = config.notifications.whitelist.iter().copied().collect();
    assert_eq!(whitelist, vec![EventKind::Crash, EventKind::PlayerJoin]);
    assert_eq!(config.notifications.channels.len(), 3);
    assert!(matches!(config.notifications.channels[0], ChannelConfig::Webhook { .. }));
    match &config.notifications.channels[1] {
        ChannelConfig::Push { server_url, topic, .. } => {
            assert_eq!(server_url.as_str(), "https://ntfy.sh/");
            assert_eq!(topic, "astro");
        }
        other => panic!("unexpected channel {:?}", other),
    }
    assert_eq!(config.notifications.channels[2], ChannelConfig::None);

    assert_eq!(config.status.as_ref().unwrap().interval_secs, 120);
    assert_eq!(config.network.public_ip, Some("203.0.113.7".parse().unwrap()));
    assert!(config.network.overwrite_public_ip);
    assert_eq!(config.network.port, 7777);

    Ok(())
}

#[test]
fn test_config_from_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "server": {{ "executable": "sh", "name": "From File" }} }}"#
    )
    .unwrap();

    let config = Config::from_file(file.path())?;
    assert_eq!(config.server.name, "From File");
    validate_config(&config)?;
    Ok(())
}

#[test]
fn test_missing_file_and_bad_json() {
    assert!(matches!(
        Config::from_file("/definitely/not/here.json"),
        Err(Error::ConfigParse(_))
    ));
    assert!(matches!(
        Config::parse_from_str("{ not json"),
        Err(Error::ConfigParse(_))
    ));
    assert!(matches!(
        Config::parse_from_str(r#"{ "server": { "executable": "sh" }, "notifications": { "whitelist": ["bogus"] } }"#),
        Err(Error::ConfigParse(_))
    ));
}

#[test]
fn test_missing_executable_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config_str = format!(
        r#"{{ "server": {{ "executable": "bin/AstroServer.exe", "workingDir": "{}" }} }}"#,
        dir.path().display()
    );
    let config = Config::parse_from_str(&config_str).unwrap();
    assert!(matches!(validate_config(&config), Err(Error::ConfigInvalid(_))));

    std::fs::create_dir(dir.path().join("bin")).unwrap();
    std::fs::write(dir.path().join("bin/AstroServer.exe"), b"").unwrap();
    assert!(validate_config(&config).is_ok());
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        r#"{ "server": { "executable": "" } }"#,
        r#"{ "server": { "executable": "sh" }, "supervisor": { "eventQueueCapacity": 0 } }"#,
        r#"{ "server": { "executable": "sh" }, "supervisor": { "startTimeoutSecs": 0 } }"#,
        r#"{ "server": { "executable": "sh" }, "notifications": { "channels": [{ "kind": "push", "topic": " " }] } }"#,
        r#"{ "server": { "executable": "sh" }, "status": { "url": "https://x.example", "intervalSecs": 0 } }"#,
        r#"{ "server": { "executable": "sh" }, "classifier": { "patterns": [{ "kind": "save", "regex": "(" }] } }"#,
    ];

    for case in cases {
        let config = Config::parse_from_str(case).unwrap();
        assert!(
            matches!(validate_config(&config), Err(Error::ConfigInvalid(_))),
            "accepted: {}",
            case
        );
    }
}
