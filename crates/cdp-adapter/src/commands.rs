//! Command parameter and result types exposed by the adapter interface.

use serde::{Deserialize, Serialize};

/// Cookie as reported by `Network.getCookies` / `Network.getAllCookies`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// Parameters accepted by `Network.deleteCookies`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCookiesParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Interception pattern for `Fetch.enable`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    pub url_pattern: String,
    pub request_stage: InterceptionStage,
}

impl Default for RequestPattern {
    fn default() -> Self {
        Self {
            url_pattern: "*".into(),
            request_stage: InterceptionStage::Request,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InterceptionStage {
    Request,
    Response,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CookiesResult {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NavigateResult {
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub error_text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateTargetResult {
    pub target_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AttachToTargetResult {
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cookie_deserializes_from_cdp_shape() {
        let result: CookiesResult = serde_json::from_value(json!({
            "cookies": [{
                "name": "_couper_access_token",
                "value": "eyJhIjoxfQ==",
                "domain": "couper",
                "path": "/",
                "expires": -1,
                "size": 40,
                "httpOnly": true,
                "secure": false,
                "session": true,
                "priority": "Medium",
                "sameParty": false,
                "sourceScheme": "NonSecure",
                "sourcePort": 8080
            }]
        }))
        .expect("cookies");

        let cookie = &result.cookies[0];
        assert_eq!(cookie.name, "_couper_access_token");
        assert!(cookie.http_only);
        assert_eq!(cookie.same_site, None);
    }

    #[test]
    fn delete_params_skip_missing_scope() {
        let params = DeleteCookiesParams {
            name: "_couper_authvv".into(),
            url: Some("http://couper:8080/_couper/oidc/callback".into()),
            domain: None,
            path: None,
        };
        assert_eq!(
            serde_json::to_value(params).expect("serialize"),
            json!({ "name": "_couper_authvv", "url": "http://couper:8080/_couper/oidc/callback" })
        );
    }

    #[test]
    fn default_pattern_pauses_every_request() {
        assert_eq!(
            serde_json::to_value(RequestPattern::default()).expect("serialize"),
            json!({ "urlPattern": "*", "requestStage": "Request" })
        );
    }
}
