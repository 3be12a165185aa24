use super::*;
use serial_test::serial;

fn set_required_env() {
    std::env::set_var("BRIDGE_TENANT_ID", "tenant-123");
    std::env::set_var("BRIDGE_CLIENT_ID", "client-abc");
    std::env::set_var("BRIDGE_CLIENT_SECRET", "secret-xyz");
    std::env::set_var("BRIDGE_USERNAME", "syncer@example.com");
    std::env::set_var("BRIDGE_PASSWORD", "hunter2-long-password");
    std::env::set_var("BRIDGE_DEFAULT_PLAN_ID", "plan-1");
    std::env::set_var("BRIDGE_WEBHOOK_PUBLIC_URL", "https://bridge.example.com/webhook");
}

fn clear_env() {
    for key in [
        "BRIDGE_TENANT_ID",
        "BRIDGE_CLIENT_ID",
        "BRIDGE_CLIENT_SECRET",
        "BRIDGE_USERNAME",
        "BRIDGE_PASSWORD",
        "BRIDGE_DEFAULT_PLAN_ID",
        "BRIDGE_WEBHOOK_PUBLIC_URL",
        "BRIDGE_USER_ID_MAP",
        "BRIDGE_CONFLICT_TIE_WINS",
        "BRIDGE_UPLOAD_WORKERS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn loads_with_required_env() {
    clear_env();
    set_required_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.sync.default_plan_id, "plan-1");
    assert_eq!(config.sync.conflict_tie_wins, TieDirection::Remote);
    assert_eq!(config.sync.upload_workers, 4);
    assert_eq!(config.webhook.port, 3978);

    clear_env();
}

#[test]
#[serial]
fn missing_plan_id_is_an_error() {
    clear_env();
    set_required_env();
    std::env::remove_var("BRIDGE_DEFAULT_PLAN_ID");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("BRIDGE_DEFAULT_PLAN_ID"));

    clear_env();
}

#[test]
#[serial]
fn rejects_malformed_webhook_url() {
    clear_env();
    set_required_env();
    std::env::set_var("BRIDGE_WEBHOOK_PUBLIC_URL", "not a url");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("BRIDGE_WEBHOOK_PUBLIC_URL"));

    clear_env();
}

#[test]
#[serial]
fn parses_user_id_map_pairs() {
    clear_env();
    set_required_env();
    std::env::set_var(
        "BRIDGE_USER_ID_MAP",
        "scout=remote-u1, analyst=remote-u2 ,",
    );

    let config = Config::from_env().unwrap();
    assert_eq!(config.sync.user_id_map.len(), 2);
    assert_eq!(config.sync.user_id_map["scout"], "remote-u1");
    assert_eq!(config.sync.user_id_map["analyst"], "remote-u2");

    clear_env();
}

#[test]
#[serial]
fn rejects_malformed_user_id_map() {
    clear_env();
    set_required_env();
    std::env::set_var("BRIDGE_USER_ID_MAP", "scout-no-equals");

    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
#[serial]
fn tie_direction_knob() {
    clear_env();
    set_required_env();
    std::env::set_var("BRIDGE_CONFLICT_TIE_WINS", "agent");

    let config = Config::from_env().unwrap();
    assert_eq!(config.sync.conflict_tie_wins, TieDirection::Agent);

    std::env::set_var("BRIDGE_CONFLICT_TIE_WINS", "coinflip");
    assert!(Config::from_env().is_err());

    clear_env();
}
