use serde::Deserialize;
use tokio::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{AdapterError, AdapterErrorKind};
use crate::DebuggerEndpoint;

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
    #[serde(rename = "Browser", default)]
    browser: Option<String>,
}

fn invalid(endpoint: &str, detail: impl std::fmt::Display) -> AdapterError {
    AdapterError::new(AdapterErrorKind::CdpIo)
        .with_hint(format!("invalid devtools endpoint {endpoint}: {detail}"))
}

fn is_debugger_path(url: &Url) -> bool {
    url.path().starts_with("/devtools/")
}

/// `/json/version` URL for a bare devtools endpoint.
pub fn version_url(endpoint: &Url) -> Result<Url, AdapterError> {
    let mut url = endpoint.clone();
    let scheme = match endpoint.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(invalid(endpoint.as_str(), format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(endpoint.as_str(), "cannot switch scheme"))?;
    url.set_path("/json/version");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Chromium reports its own bind address in `/json/version`; point it back at the
/// host and port the caller actually reached.
pub fn rewrite_authority(reported: &str, endpoint: &Url) -> Result<String, AdapterError> {
    let mut url = Url::parse(reported).map_err(|err| invalid(reported, err))?;
    url.set_host(endpoint.host_str())
        .map_err(|err| invalid(reported, err))?;
    url.set_port(endpoint.port())
        .map_err(|_| invalid(reported, "cannot set port"))?;
    if matches!(endpoint.scheme(), "wss" | "https") {
        url.set_scheme("wss")
            .map_err(|_| invalid(reported, "cannot switch scheme"))?;
    }
    Ok(url.to_string())
}

/// Resolve the websocket URL of a remote Chromium.
///
/// A URL that already names a `/devtools/...` target is used as-is. Anything else is
/// treated as the debugger's base address and resolved through `/json/version`.
pub async fn resolve_ws_url(
    endpoint: &str,
    timeout: Duration,
) -> Result<DebuggerEndpoint, AdapterError> {
    let parsed = Url::parse(endpoint).map_err(|err| invalid(endpoint, err))?;
    if matches!(parsed.scheme(), "ws" | "wss") && is_debugger_path(&parsed) {
        return Ok(DebuggerEndpoint {
            ws_url: endpoint.to_string(),
            browser: None,
        });
    }

    let discovery = version_url(&parsed)?;
    debug!(target: "cdp-transport", url = %discovery, "discovering devtools websocket");

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))?;
    let info: VersionInfo = client
        .get(discovery.clone())
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("devtools discovery via {discovery} failed: {err}"))
                .retriable(true)
        })?
        .json()
        .await
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Protocol)
                .with_hint(format!("malformed /json/version response: {err}"))
        })?;

    Ok(DebuggerEndpoint {
        ws_url: rewrite_authority(&info.web_socket_debugger_url, &parsed)?,
        browser: info.browser,
    })
}
