//! Flow scenarios: where to start, which cookies matter and what the chain must look like.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::errors::FlowError;
use crate::expect::ExpectedEvent;

pub const DEFAULT_ORIGIN: &str = "http://couper:8080/";
pub const DEFAULT_PROVIDER: &str = "http://testop:8080/";

/// Names of the cookies the gateway manages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieNames {
    /// Issued at the end of a successful flow.
    pub token: String,
    /// PKCE verifier; lives only between the start and callback hops.
    pub verifier: String,
}

impl Default for CookieNames {
    fn default() -> Self {
        Self {
            token: "_couper_access_token".into(),
            verifier: "_couper_authvv".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_name")]
    pub name: String,
    /// Gateway origin with trailing slash, e.g. `http://couper:8080/`.
    pub origin: String,
    /// Protected resource, relative to `origin`.
    pub entry_path: String,
    /// Callback endpoint, relative to `origin`. The verifier cookie is scoped to it.
    pub callback_path: String,
    #[serde(default)]
    pub cookies: CookieNames,
    pub expected: Vec<ExpectedEvent>,
}

fn default_name() -> String {
    "oidc-flow".into()
}

fn with_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}{}", with_slash(base), path.trim_start_matches('/'))
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl Scenario {
    /// The Couper OIDC gateway chain: protected resource, login start, provider
    /// authorization, callback, and the resource again.
    pub fn couper(origin: &str, provider: &str) -> Self {
        let origin = with_slash(origin);
        let entry_path = "en/docs/?foo=oidc-test";
        let callback_path = "_couper/oidc/callback";
        let return_to = encode(&format!("/{entry_path}"));
        let cookies = CookieNames::default();
        let entry = join(&origin, entry_path);
        let authorize = join(provider, "auth?client_id=foo&code_challenge=");
        let callback = format!(
            "{}?code=asdf&state={return_to}",
            join(&origin, callback_path)
        );

        let expected = vec![
            ExpectedEvent::new(entry.clone(), 403),
            ExpectedEvent::new(
                join(&origin, &format!("_couper/oidc/start?url={return_to}")),
                303,
            )
            .with_header("Cache-Control", "no-cache,no-store")
            .with_header("Location", authorize.clone())
            .with_header("Set-Cookie", format!("{}=", cookies.verifier)),
            ExpectedEvent::new(authorize, 303)
                .with_header("Cache-Control", "no-cache,no-store")
                .with_header("Location", callback.clone()),
            ExpectedEvent::new(callback, 303)
                .with_header("Cache-Control", "no-cache,no-store")
                .with_header("Set-Cookie", format!("{}=ey", cookies.token)),
            ExpectedEvent::new(entry, 200),
        ];

        Self {
            name: "couper-oidc".into(),
            origin,
            entry_path: entry_path.into(),
            callback_path: callback_path.into(),
            cookies,
            expected,
        }
    }

    pub fn entry_url(&self) -> String {
        join(&self.origin, &self.entry_path)
    }

    /// Scope used to clear the token cookie.
    pub fn origin_url(&self) -> String {
        with_slash(&self.origin)
    }

    /// Scope used to clear the verifier cookie.
    pub fn callback_url(&self) -> String {
        join(&self.origin, &self.callback_path)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        for (what, value) in [("origin", self.origin_url()), ("entry", self.entry_url())] {
            let url = Url::parse(&value)
                .map_err(|err| FlowError::Config(format!("{what} url {value:?}: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(FlowError::Config(format!(
                    "{what} url {value:?} is not http(s)"
                )));
            }
        }
        if self.expected.is_empty() {
            return Err(FlowError::Config(format!(
                "scenario {:?} declares no expected events",
                self.name
            )));
        }
        if self.cookies.token.is_empty() || self.cookies.verifier.is_empty() {
            return Err(FlowError::Config("cookie names must not be empty".into()));
        }
        Ok(())
    }

    pub fn from_yaml(raw: &str) -> Result<Self, FlowError> {
        let scenario: Self = serde_yaml::from_str(raw)
            .map_err(|err| FlowError::Config(format!("parsing scenario: {err}")))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub async fn load(path: &Path) -> Result<Self, FlowError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| FlowError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_yaml(&raw)
    }

    pub fn to_yaml(&self) -> Result<String, FlowError> {
        serde_yaml::to_string(self).map_err(|err| FlowError::Config(err.to_string()))
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::couper(DEFAULT_ORIGIN, DEFAULT_PROVIDER)
    }
}
