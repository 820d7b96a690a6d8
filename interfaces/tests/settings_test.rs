use interfaces::{CommandSettings, FetchOutcome, Item, RssSettings, SourceKind, SourceSettings, WebSettings};

#[test]
fn test_settings_tagged_by_kind() {
    let json = r#"{"kind": "command", "settings": {"command": "printf '1\n2'"}}"#;
    let settings: SourceSettings = serde_json::from_str(json).unwrap();

    assert_eq!(settings.kind(), SourceKind::Command);
    match &settings {
        SourceSettings::Command(cmd) => {
            assert_eq!(cmd.command, "printf '1\n2'");
            assert_eq!(cmd.timeout_seconds, 60);
        }
        other => panic!("unexpected settings {:?}", other),
    }

    let round_trip = serde_json::to_value(&settings).unwrap();
    assert_eq!(round_trip["kind"], "command");
}

#[test]
fn test_unknown_kind_rejected() {
    let json = r#"{"kind": "gopher", "settings": {"url": "gopher://x"}}"#;
    assert!(serde_json::from_str::<SourceSettings>(json).is_err());
}

#[test]
fn test_validate_settings() {
    let ok = SourceSettings::Web(WebSettings {
        url: "https://example.com/page".to_string(),
        timeout_seconds: Some(10),
    });
    assert!(ok.validate().is_ok());

    let bad_url = SourceSettings::Rss(RssSettings {
        url: "ftp://example.com/feed".to_string(),
        max_items: None,
    });
    let err = bad_url.validate().unwrap_err();
    assert_eq!(err.field, "url");

    let no_host = SourceSettings::Web(WebSettings {
        url: "https:///path".to_string(),
        timeout_seconds: None,
    });
    assert!(no_host.validate().is_err());

    let empty_cmd = SourceSettings::Command(CommandSettings {
        command: "   ".to_string(),
        timeout_seconds: 5,
    });
    assert_eq!(empty_cmd.validate().unwrap_err().field, "command");
}

#[test]
fn test_single_payload_outcome() {
    let outcome = FetchOutcome::single("raw", Default::default());
    match outcome {
        FetchOutcome::Content { items, hints } => {
            assert_eq!(items, vec![Item::new("raw")]);
            assert!(hints.is_empty());
        }
        FetchOutcome::NotModified => panic!("expected content"),
    }
}
