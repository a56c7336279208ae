use std::io::Write;
use std::time::Duration;
use voice_relay::codec::EncodingMode;
use voice_relay::Config;

fn write_config(contents: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voice-relay.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    // `config` resolves the extension itself
    let stem = dir.path().join("voice-relay").to_string_lossy().to_string();
    (dir, stem)
}

#[test]
fn test_defaults() {
    let cfg = Config::from_defaults().unwrap();

    assert_eq!(cfg.broker.request_topic, "iot/+/audio_request");
    assert_eq!(cfg.broker.response_topic, "iot/{device_id}/audio_response");
    assert_eq!(cfg.broker.health_topic, "iot/server/health");
    assert_eq!(cfg.broker.publish_retries, 3);
    assert_eq!(cfg.upstream.provider, "openai");
    assert!(cfg.upstream.api_key.is_none());
    assert_eq!(cfg.server.max_concurrent_sessions, 50);
    assert_eq!(cfg.server.session_timeout(), Duration::from_secs(300));
    assert_eq!(cfg.server.health_check_interval(), Duration::from_secs(30));
    assert_eq!(cfg.server.http.port, 8080);
    assert_eq!(cfg.codec.encoding, EncodingMode::Base64);
}

#[test]
fn test_file_overrides_defaults() {
    let (_dir, path) = write_config(
        r#"
[upstream]
provider = "echo"

[server]
max_concurrent_sessions = 4
session_timeout_seconds = 60

[codec]
encoding = "raw"
target_chunk_bytes = 1024
"#,
    );

    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.upstream.provider, "echo");
    assert_eq!(cfg.server.max_concurrent_sessions, 4);
    assert_eq!(cfg.server.session_timeout(), Duration::from_secs(60));
    assert_eq!(cfg.codec.encoding, EncodingMode::Raw);
    assert_eq!(cfg.codec.target_chunk_bytes, 1024);
    // Untouched keys keep their defaults
    assert_eq!(cfg.broker.publish_backoff_ms, 100);
}

#[test]
fn test_env_overrides_file() {
    let (_dir, path) = write_config(
        r#"
[upstream]
provider = "echo"

[server]
idle_grace_ms = 1000
"#,
    );

    std::env::set_var("VOICE_RELAY_SERVER__IDLE_GRACE_MS", "750");
    let cfg = Config::load(&path);
    std::env::remove_var("VOICE_RELAY_SERVER__IDLE_GRACE_MS");

    assert_eq!(cfg.unwrap().server.idle_grace(), Duration::from_millis(750));
}

#[test]
fn test_openai_requires_api_key() {
    let (_dir, path) = write_config(
        r#"
[upstream]
provider = "openai"
"#,
    );

    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("api_key"));
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut cfg = Config::from_defaults().unwrap();
    cfg.upstream.provider = "echo".to_string();
    assert!(cfg.validate().is_ok());

    let mut zero = cfg.clone();
    zero.server.max_concurrent_sessions = 0;
    assert!(zero.validate().is_err());

    let mut no_placeholder = cfg.clone();
    no_placeholder.broker.response_topic = "iot/responses".to_string();
    assert_eq!(
        no_placeholder.validate().unwrap_err().error_code(),
        "CONFIG_ERROR"
    );
}

#[test]
fn test_redacted_masks_secrets() {
    let mut cfg = Config::from_defaults().unwrap();
    cfg.upstream.api_key = Some("sk-secret".to_string());
    cfg.broker.password = Some("hunter2".to_string());

    let shown = format!("{:?}", cfg.redacted());
    assert!(!shown.contains("sk-secret"));
    assert!(!shown.contains("hunter2"));
    assert_eq!(cfg.upstream.api_key.as_deref(), Some("sk-secret"));
}

#[test]
fn test_overrides_win_over_file() {
    let (_dir, path) = write_config(
        r#"
[upstream]
provider = "openai"
"#,
    );

    let cfg = Config::load_with_overrides(&path, &[("upstream.provider", "echo".to_string())]).unwrap();
    assert_eq!(cfg.upstream.provider, "echo");
}
