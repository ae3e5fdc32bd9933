//! Declarative expectations over an observed timeline.
//!
//! Matching is positional: the i-th expected step is compared with the i-th observed
//! entry and nothing else. Every field of an [`ExpectedEvent`] is a partial constraint:
//! an empty URL, a zero status or absent headers always pass.

use std::fmt;

use network_timeline::{Headers, ObservedEvent};
use serde::{Deserialize, Serialize};

/// Characters after which an expected URL is already an open-ended prefix.
const OPEN_ENDED: &[char] = &['/', '?', '&', '=', '#'];
/// Characters that may follow a closed expected URL in the observed one.
const BOUNDARY: &[char] = &['?', '#', '/', '&', '='];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEvent {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status_code: i64,
    /// Header name to required value prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl ExpectedEvent {
    pub fn new(url: impl Into<String>, status_code: i64) -> Self {
        Self {
            url: url.into(),
            status_code,
            headers: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.into(), prefix.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MismatchKind {
    /// Fewer observed entries than expected steps.
    TooShort,
    Url,
    Status,
    MissingHeader(String),
    HeaderValue(String),
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => f.write_str("timeline ended early"),
            Self::Url => f.write_str("url differs"),
            Self::Status => f.write_str("status differs"),
            Self::MissingHeader(name) => write!(f, "header {name:?} missing"),
            Self::HeaderValue(name) => write!(f, "header {name:?} has wrong value"),
        }
    }
}

/// First step at which the timeline diverged from the expectation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    /// 0-based position in the expectation.
    pub index: usize,
    pub kind: MismatchKind,
    pub expected: Option<ExpectedEvent>,
    pub observed: Option<ObservedEvent>,
}

impl Mismatch {
    /// 1-based step number as printed in reports.
    pub fn step(&self) -> usize {
        self.index + 1
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event #{:02} (index {}): {}\nwant: {:?}\ngot:  {:?}",
            self.step(),
            self.index,
            self.kind,
            self.expected,
            self.observed
        )
    }
}

impl std::error::Error for Mismatch {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedStep {
    pub index: usize,
    pub url: String,
    pub status_code: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    pub steps: Vec<MatchedStep>,
    /// Observed entries past the last expected step; they are not inspected.
    pub unchecked: usize,
}

/// Whether `expected` is a prefix of `observed` ending on a URL component boundary.
pub fn url_matches(expected: &str, observed: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    let Some(rest) = observed.strip_prefix(expected) else {
        return false;
    };
    rest.is_empty() || expected.ends_with(OPEN_ENDED) || rest.starts_with(BOUNDARY)
}

fn check_headers(expected: &Headers, observed: &Headers) -> Result<(), MismatchKind> {
    for (name, prefix) in expected {
        match observed.get(name) {
            None => return Err(MismatchKind::MissingHeader(name.clone())),
            Some(value) if !value.starts_with(prefix.as_str()) => {
                return Err(MismatchKind::HeaderValue(name.clone()))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_step(expected: &ExpectedEvent, observed: &ObservedEvent) -> Result<(), MismatchKind> {
    if !url_matches(&expected.url, &observed.url) {
        return Err(MismatchKind::Url);
    }
    if expected.status_code != 0 && expected.status_code != observed.status_code {
        return Err(MismatchKind::Status);
    }
    match &expected.headers {
        Some(headers) => check_headers(headers, &observed.headers),
        None => Ok(()),
    }
}

/// Compare `observed` against `expected` index by index.
pub fn match_timeline(
    expected: &[ExpectedEvent],
    observed: &[ObservedEvent],
) -> Result<MatchReport, Mismatch> {
    if observed.len() < expected.len() {
        let index = observed.len();
        return Err(Mismatch {
            index,
            kind: MismatchKind::TooShort,
            expected: expected.get(index).cloned(),
            observed: None,
        });
    }

    let mut report = MatchReport {
        steps: Vec::with_capacity(expected.len()),
        unchecked: observed.len() - expected.len(),
    };
    for (index, (want, got)) in expected.iter().zip(observed).enumerate() {
        if let Err(kind) = check_step(want, got) {
            return Err(Mismatch {
                index,
                kind,
                expected: Some(want.clone()),
                observed: Some(got.clone()),
            });
        }
        report.steps.push(MatchedStep {
            index,
            url: got.url.clone(),
            status_code: got.status_code,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_timeline::EventKind;

    fn observed(url: &str, status: i64, headers: &[(&str, &str)]) -> ObservedEvent {
        ObservedEvent {
            kind: EventKind::RequestPaused,
            url: url.into(),
            status_code: status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            request_id: None,
        }
    }

    #[test]
    fn url_prefix_respects_component_boundaries() {
        assert!(url_matches("http://host/a", "http://host/a"));
        assert!(url_matches("http://host/a", "http://host/a?x=1"));
        assert!(url_matches("http://host/a", "http://host/a/b"));
        assert!(url_matches("http://host/a", "http://host/a#top"));
        assert!(!url_matches("http://host/a", "http://host/ab"));
        assert!(url_matches("", "anything"));
    }

    #[test]
    fn open_ended_expectations_accept_any_suffix() {
        assert!(url_matches(
            "http://testop:8080/auth?client_id=foo&code_challenge=",
            "http://testop:8080/auth?client_id=foo&code_challenge=Xk3h9_q"
        ));
        assert!(url_matches("http://couper:8080/", "http://couper:8080/en/docs/"));
    }

    #[test]
    fn short_timeline_fails_at_its_length() {
        let expected = vec![
            ExpectedEvent::new("http://host/", 200),
            ExpectedEvent::new("http://host/next", 200),
        ];
        let err = match_timeline(&expected, &[observed("http://host/", 200, &[])])
            .expect_err("too short");
        assert_eq!(err.index, 1);
        assert_eq!(err.kind, MismatchKind::TooShort);
        assert!(err.observed.is_none());
    }

    #[test]
    fn zero_status_and_absent_headers_are_wildcards() {
        let expected = vec![ExpectedEvent::new("http://host/", 0)];
        let report = match_timeline(
            &expected,
            &[
                observed("http://host/", 418, &[("X-Any", "1")]),
                observed("http://host/favicon.ico", 404, &[]),
            ],
        )
        .expect("match");
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].status_code, 418);
        assert_eq!(report.unchecked, 1);
    }

    #[test]
    fn header_values_match_by_prefix() {
        let expected = vec![ExpectedEvent::new("http://host/start", 303)
            .with_header("Set-Cookie", "_couper_authvv=")
            .with_header("Cache-Control", "no-cache,no-store")];
        let ok = observed(
            "http://host/start",
            303,
            &[
                ("Set-Cookie", "_couper_authvv=abc; Path=/; HttpOnly"),
                ("Cache-Control", "no-cache,no-store"),
            ],
        );
        assert!(match_timeline(&expected, &[ok]).is_ok());

        let bad = observed(
            "http://host/start",
            303,
            &[
                ("Set-Cookie", "other=1"),
                ("Cache-Control", "no-cache,no-store"),
            ],
        );
        let err = match_timeline(&expected, &[bad]).expect_err("wrong value");
        assert_eq!(err.kind, MismatchKind::HeaderValue("Set-Cookie".into()));
    }

    #[test]
    fn missing_header_fails_regardless_of_other_keys() {
        let expected =
            vec![ExpectedEvent::new("", 0).with_header("Location", "http://testop:8080/auth")];
        let extra: Vec<(String, String)> = (0..20)
            .map(|n| (format!("X-Extra-{n}"), "http://testop:8080/auth".to_string()))
            .collect();
        let mut entry = observed("http://host/", 303, &[]);
        entry.headers.extend(extra);
        entry
            .headers
            .insert("location".into(), "http://testop:8080/auth".into());

        let err = match_timeline(&expected, &[entry]).expect_err("case-sensitive key");
        assert_eq!(err.kind, MismatchKind::MissingHeader("Location".into()));
    }

    #[test]
    fn mismatch_names_one_based_step() {
        let expected = vec![
            ExpectedEvent::new("http://host/", 403),
            ExpectedEvent::new("http://host/", 200),
        ];
        let err = match_timeline(
            &expected,
            &[observed("http://host/", 403, &[]), observed("http://host/", 500, &[])],
        )
        .expect_err("status");
        let text = err.to_string();
        assert!(text.starts_with("event #02 (index 1): status differs"), "{text}");
        assert!(text.contains("want:"));
        assert!(text.contains("got:"));
    }

    #[test]
    fn permutations_fail_unless_identity_on_prefix() {
        let expected = vec![
            ExpectedEvent::new("http://host/one", 200),
            ExpectedEvent::new("http://host/two", 201),
            ExpectedEvent::new("http://host/three", 202),
        ];
        let base = vec![
            observed("http://host/one", 200, &[]),
            observed("http://host/two", 201, &[]),
            observed("http://host/three", 202, &[]),
        ];
        let permutations: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in permutations {
            let shuffled: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();
            let result = match_timeline(&expected, &shuffled);
            if order == [0, 1, 2] {
                assert!(result.is_ok());
            } else {
                let first_moved = order
                    .iter()
                    .enumerate()
                    .position(|(pos, &i)| pos != i)
                    .expect("non-identity");
                assert_eq!(result.expect_err("permuted").index, first_moved, "{order:?}");
            }
        }
    }

    #[test]
    fn expectations_load_from_yaml() {
        let yaml = r#"
- url: "http://couper:8080/en/docs/?foo=oidc-test"
  status_code: 403
- url: "http://couper:8080/_couper/oidc/start"
  status_code: 303
  headers:
    Location: "http://testop:8080/auth?client_id=foo&code_challenge="
"#;
        let expected: Vec<ExpectedEvent> = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(expected.len(), 2);
        assert!(expected[0].headers.is_none());
        assert_eq!(
            expected[1].headers.as_ref().map(|h| h.len()),
            Some(1)
        );
    }
}
