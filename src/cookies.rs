//! Cookie state checks around the flow.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use cdp_adapter::{BrowserSession, Cookie};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::FlowError;
use crate::scenario::{CookieNames, Scenario};

/// Remove the token cookie at the origin and the verifier cookie at the callback.
pub async fn clear(session: &dyn BrowserSession, scenario: &Scenario) -> Result<(), FlowError> {
    let names = &scenario.cookies;
    for (name, scope) in [
        (&names.token, scenario.origin_url()),
        (&names.verifier, scenario.callback_url()),
    ] {
        session
            .delete_cookies(name, &scope)
            .await
            .map_err(|err| FlowError::from_adapter(&format!("deleting cookie {name}"), err))?;
        debug!(target: "flowprobe::cookies", %name, %scope, "cookie cleared");
    }
    Ok(())
}

/// Neither reserved cookie may be present before the flow starts.
pub fn verify_clean(cookies: &[Cookie], names: &CookieNames) -> Result<(), FlowError> {
    match cookies
        .iter()
        .find(|c| c.name == names.token || c.name == names.verifier)
    {
        Some(cookie) => Err(FlowError::Precondition(format!(
            "expected cleared cookies, found {}={}",
            cookie.name, cookie.value
        ))),
        None => Ok(()),
    }
}

/// Decode a token cookie value into its JSON object.
///
/// A JWT-shaped value (`<header>.<payload>.<signature>`) is judged by its leading
/// segment; a plain base64 value is decoded whole.
pub fn decode_token(value: &str) -> Result<Map<String, Value>, String> {
    let value = value.trim();
    let segment = value.split_once('.').map_or(value, |(head, _)| head);
    let bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(segment).ok())
        .ok_or_else(|| "value is not base64".to_string())?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("decoded value is not a JSON object: {other}")),
        Err(err) => Err(format!("decoded value is not JSON: {err}")),
    }
}

/// The token cookie must exist and decode to a JSON object; the verifier must be gone.
pub fn verify_issued(
    cookies: &[Cookie],
    names: &CookieNames,
) -> Result<Map<String, Value>, FlowError> {
    let token = cookies
        .iter()
        .find(|c| c.name == names.token)
        .ok_or_else(|| FlowError::Postcondition(format!("expected cookie: {:?}", names.token)))?;
    let claims = decode_token(&token.value).map_err(|reason| {
        FlowError::Postcondition(format!("cookie {:?}: {reason}", names.token))
    })?;

    if cookies.iter().any(|c| c.name == names.verifier) {
        return Err(FlowError::Postcondition(format!(
            "unexpected cookie: {:?}",
            names.verifier
        )));
    }

    info!(
        target: "flowprobe::cookies",
        cookie = %names.token,
        claims = claims.len(),
        "token cookie issued"
    );
    Ok(claims)
}
