//! Transport-level tests against a remote Chromium.
//!
//! Run with:
//! ```bash
//! export FLOWPROBE_REAL_CHROME=1
//! export FLOWPROBE_WS_URL=ws://127.0.0.1:9222/
//! cargo test -p cdp-adapter --test integration_tests -- --nocapture
//! ```

use cdp_adapter::config::CdpConfig;
use cdp_adapter::transport::{CdpTransport, ChromiumTransport, CommandTarget};
use cdp_adapter::util::resolve_ws_url;
use cdp_adapter::AdapterErrorKind;
use serde_json::json;
use std::env;
use std::time::Duration;

fn should_run_real_tests() -> bool {
    env::var("FLOWPROBE_REAL_CHROME")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn test_config() -> Option<CdpConfig> {
    let cfg = CdpConfig::default();
    cfg.websocket_url.is_some().then_some(cfg)
}

#[tokio::test]
async fn test_remote_discovery_and_version() {
    if !should_run_real_tests() {
        println!("Skipping real browser test (FLOWPROBE_REAL_CHROME not set)");
        return;
    }
    let Some(cfg) = test_config() else {
        println!("Skipping real browser test (FLOWPROBE_WS_URL not set)");
        return;
    };

    let endpoint = resolve_ws_url(
        cfg.websocket_url.as_deref().unwrap_or_default(),
        Duration::from_millis(cfg.discovery_timeout_ms),
    )
    .await
    .expect("discover websocket url");
    assert!(endpoint.ws_url.contains("/devtools/"));

    let transport = ChromiumTransport::new(cfg);
    transport.start().await.expect("transport start");
    let version = transport
        .send_command(CommandTarget::Browser, "Browser.getVersion", json!({}))
        .await
        .expect("Browser.getVersion");
    assert!(version.get("product").is_some());
}

#[tokio::test]
async fn test_create_and_attach_target() {
    if !should_run_real_tests() {
        println!("Skipping real browser test (FLOWPROBE_REAL_CHROME not set)");
        return;
    }
    let Some(cfg) = test_config() else {
        println!("Skipping real browser test (FLOWPROBE_WS_URL not set)");
        return;
    };

    let transport = ChromiumTransport::new(cfg);
    transport.start().await.expect("transport start");
    let created = transport
        .send_command(
            CommandTarget::Browser,
            "Target.createTarget",
            json!({ "url": "about:blank" }),
        )
        .await
        .expect("create target");
    let target_id = created["targetId"].as_str().expect("targetId").to_string();

    let attached = transport
        .send_command(
            CommandTarget::Browser,
            "Target.attachToTarget",
            json!({ "targetId": target_id, "flatten": true }),
        )
        .await
        .expect("attach");
    let session = attached["sessionId"].as_str().expect("sessionId").to_string();

    transport
        .send_command(CommandTarget::Session(session), "Network.enable", json!({}))
        .await
        .expect("network enable");

    transport
        .send_command(
            CommandTarget::Browser,
            "Target.closeTarget",
            json!({ "targetId": target_id }),
        )
        .await
        .expect("close target");
}

#[tokio::test]
async fn test_unreachable_endpoint_reports_io_error() {
    let err = resolve_ws_url("http://127.0.0.1:9/", Duration::from_millis(500))
        .await
        .expect_err("nothing listens on the discard port");
    assert_eq!(err.kind, AdapterErrorKind::CdpIo);
}
