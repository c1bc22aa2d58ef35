//! Response classification.
//!
//! A response is labelled by walking an ordered list of rules; the first
//! rule that returns an outcome wins, and a response no rule claims is a
//! success. Built-in order: retryable status, 429, 403, content type,
//! body size, block keywords. Operator rules run after the built-ins.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the caller expects the response body to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expect {
    /// An HTML content page. Content-type and size heuristics apply.
    #[default]
    Html,
    /// Any payload. Only status and keyword rules apply.
    Any,
}

/// Evidence that a 2xx response is actually a block page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSignal {
    UnexpectedContentType(String),
    UndersizedBody { size: u64, min: u64 },
    Keyword(String),
    /// Raised by an operator-supplied rule.
    Custom(String),
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedContentType(ct) => write!(f, "unexpected content type {}", ct),
            Self::UndersizedBody { size, min } => {
                write!(f, "body of {} bytes is below {} bytes", size, min)
            }
            Self::Keyword(k) => write!(f, "block keyword '{}'", k),
            Self::Custom(reason) => f.write_str(reason),
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableServerError { status: u16 },
    RateLimited { retry_after_secs: Option<u64> },
    BlockedCaptcha { signal: BlockSignal },
    BlockedUnknown { status: u16 },
    NetworkError { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::BlockedCaptcha { .. } | Self::BlockedUnknown { .. })
    }

    /// Server-requested wait, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableServerError { .. } => "retryable_server_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::BlockedCaptcha { .. } => "blocked_captcha",
            Self::BlockedUnknown { .. } => "blocked_unknown",
            Self::NetworkError { .. } => "network_error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::RetryableServerError { status } => write!(f, "retryable server error ({})", status),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limited (retry after {}s)", secs),
            Self::RateLimited { .. } => f.write_str("rate limited"),
            Self::BlockedCaptcha { signal } => write!(f, "blocked: {}", signal),
            Self::BlockedUnknown { status } => write!(f, "blocked ({})", status),
            Self::NetworkError { message } => write!(f, "network error: {}", message),
        }
    }
}

/// Borrowed view of a completed response, as rules see it.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    /// Header names are expected lowercase.
    pub headers: &'a HashMap<String, String>,
    pub body_sample: &'a [u8],
    pub body_size: u64,
    pub expect: Expect,
}

impl ResponseView<'_> {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str()).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// One step of the classification rule list.
pub trait ClassificationRule: Send + Sync {
    fn name(&self) -> &str;

    /// Return `Some` to claim the response, `None` to pass it on.
    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome>;
}

struct RetryableStatusRule {
    statuses: BTreeSet<u16>,
}

impl ClassificationRule for RetryableStatusRule {
    fn name(&self) -> &str {
        "retryable_status"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        self.statuses
            .contains(&response.status)
            .then_some(Outcome::RetryableServerError {
                status: response.status,
            })
    }
}

struct RateLimitRule;

impl ClassificationRule for RateLimitRule {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        (response.status == 429).then(|| Outcome::RateLimited {
            retry_after_secs: response
                .header("retry-after")
                .and_then(|v| parse_retry_after(v, Utc::now())),
        })
    }
}

struct ForbiddenRule;

impl ClassificationRule for ForbiddenRule {
    fn name(&self) -> &str {
        "forbidden"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        (response.status == 403).then_some(Outcome::BlockedUnknown { status: 403 })
    }
}

struct ContentTypeRule;

impl ClassificationRule for ContentTypeRule {
    fn name(&self) -> &str {
        "content_type"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        if response.expect != Expect::Html {
            return None;
        }
        let offending = match response.content_type() {
            Some(ct) if !is_textual(ct) => Some(mime_essence(ct)),
            Some(_) => None,
            None => infer::get(response.body_sample)
                .filter(|kind| !matches!(kind.matcher_type(), infer::MatcherType::Text))
                .map(|kind| kind.mime_type().to_string()),
        };
        offending.map(|ct| Outcome::BlockedCaptcha {
            signal: BlockSignal::UnexpectedContentType(ct),
        })
    }
}

struct MinBodySizeRule {
    min_bytes: u64,
}

impl ClassificationRule for MinBodySizeRule {
    fn name(&self) -> &str {
        "min_body_size"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        (response.expect == Expect::Html && response.body_size < self.min_bytes).then(|| {
            Outcome::BlockedCaptcha {
                signal: BlockSignal::UndersizedBody {
                    size: response.body_size,
                    min: self.min_bytes,
                },
            }
        })
    }
}

struct KeywordRule {
    /// Lowercased.
    keywords: Vec<String>,
}

impl ClassificationRule for KeywordRule {
    fn name(&self) -> &str {
        "block_keyword"
    }

    fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
        if self.keywords.is_empty() || response.body_sample.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(response.body_sample).to_lowercase();
        self.keywords
            .iter()
            .find(|k| text.contains(k.as_str()))
            .map(|k| Outcome::BlockedCaptcha {
                signal: BlockSignal::Keyword(k.clone()),
            })
    }
}

/// Strip parameters and normalize case: `Text/HTML; charset=utf-8` -> `text/html`.
fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a content type is something a page fetch can legitimately return.
pub fn is_textual(content_type: &str) -> bool {
    let essence = mime_essence(content_type);
    if essence.is_empty() {
        return true;
    }
    essence.starts_with("text/")
        || essence.ends_with("/xml")
        || essence.ends_with("+xml")
        || essence.ends_with("/json")
        || essence.ends_with("+json")
        || essence.contains("javascript")
}

/// Parse a `Retry-After` value (delta seconds or HTTP date) into seconds from `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let secs = (at.with_timezone(&Utc) - now).num_seconds();
    Some(secs.max(0) as u64)
}

pub const DEFAULT_MIN_BODY_BYTES: u64 = 5 * 1024;
pub const DEFAULT_BODY_SAMPLE_BYTES: usize = 64 * 1024;
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[500, 502, 503, 504, 522, 524];
pub const DEFAULT_BLOCK_KEYWORDS: &[&str] = &[
    "captcha",
    "automated access",
    "robot check",
    "unusual traffic",
    "are you a human",
    "access denied",
];

/// Tunables for the built-in rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    pub retryable_statuses: Vec<u16>,
    pub min_body_bytes: u64,
    pub keywords: Vec<String>,
    /// Leading bytes of the body that keyword and sniffing rules inspect.
    pub body_sample_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            min_body_bytes: DEFAULT_MIN_BODY_BYTES,
            keywords: DEFAULT_BLOCK_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            body_sample_bytes: DEFAULT_BODY_SAMPLE_BYTES,
        }
    }
}

/// Ordered rule list; first match wins, otherwise success.
pub struct ResponseClassifier {
    rules: Vec<Box<dyn ClassificationRule>>,
    body_sample_bytes: usize,
}

impl ResponseClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let rules: Vec<Box<dyn ClassificationRule>> = vec![
            Box::new(RetryableStatusRule {
                statuses: config.retryable_statuses.iter().copied().collect(),
            }),
            Box::new(RateLimitRule),
            Box::new(ForbiddenRule),
            Box::new(ContentTypeRule),
            Box::new(MinBodySizeRule {
                min_bytes: config.min_body_bytes,
            }),
            Box::new(KeywordRule {
                keywords: config
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
            }),
        ];
        Self {
            rules,
            body_sample_bytes: config.body_sample_bytes,
        }
    }

    /// Append an operator rule. It runs after every built-in rule.
    pub fn with_rule(mut self, rule: impl ClassificationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Label a completed response. Total: every input yields exactly one outcome.
    pub fn classify(
        &self,
        status: u16,
        headers: &HashMap<String, String>,
        body_sample: &[u8],
        body_size: u64,
        expect: Expect,
    ) -> Outcome {
        let sample = &body_sample[..body_sample.len().min(self.body_sample_bytes)];
        let view = ResponseView {
            status,
            headers,
            body_sample: sample,
            body_size,
            expect,
        };

        for rule in &self.rules {
            if let Some(outcome) = rule.evaluate(&view) {
                debug!("Rule '{}' classified status {} as {}", rule.name(), status, outcome);
                return outcome;
            }
        }
        Outcome::Success
    }
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl fmt::Debug for ResponseClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseClassifier")
            .field("rules", &self.rule_names())
            .field("body_sample_bytes", &self.body_sample_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn html_page(size: usize) -> Vec<u8> {
        let mut body = b"<html><body>".to_vec();
        body.resize(size, b'x');
        body
    }

    #[test]
    fn service_unavailable_is_retryable() {
        let classifier = ResponseClassifier::default();
        let outcome = classifier.classify(
            503,
            &headers(&[("content-type", "text/plain")]),
            b"Service Unavailable",
            40,
            Expect::Html,
        );
        assert_eq!(outcome, Outcome::RetryableServerError { status: 503 });
    }

    #[test]
    fn image_on_html_request_is_blocked() {
        let classifier = ResponseClassifier::default();
        let body = vec![0xFFu8; 12_000];
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "image/jpeg")]),
            &body,
            12_000,
            Expect::Html,
        );
        assert_eq!(
            outcome,
            Outcome::BlockedCaptcha {
                signal: BlockSignal::UnexpectedContentType("image/jpeg".into())
            }
        );
    }

    #[test]
    fn large_clean_html_is_success() {
        let classifier = ResponseClassifier::default();
        let body = html_page(250_000);
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "text/html; charset=utf-8")]),
            &body,
            250_000,
            Expect::Html,
        );
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn rate_limit_parses_retry_after() {
        let classifier = ResponseClassifier::default();
        let outcome = classifier.classify(
            429,
            &headers(&[("retry-after", "120")]),
            b"",
            0,
            Expect::Html,
        );
        assert_eq!(
            outcome,
            Outcome::RateLimited {
                retry_after_secs: Some(120)
            }
        );
        assert_eq!(outcome.retry_after_secs(), Some(120));
    }

    #[test]
    fn retry_after_accepts_http_dates() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:29:30 GMT", now),
            Some(90)
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(0)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn forbidden_is_blocked_unknown() {
        let classifier = ResponseClassifier::default();
        let body = html_page(20_000);
        let outcome = classifier.classify(403, &headers(&[]), &body, 20_000, Expect::Html);
        assert_eq!(outcome, Outcome::BlockedUnknown { status: 403 });
    }

    #[test]
    fn small_body_is_flagged_before_keywords() {
        let classifier = ResponseClassifier::default();
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "text/html")]),
            b"<html>please solve this captcha</html>",
            38,
            Expect::Html,
        );
        assert_eq!(
            outcome,
            Outcome::BlockedCaptcha {
                signal: BlockSignal::UndersizedBody {
                    size: 38,
                    min: DEFAULT_MIN_BODY_BYTES
                }
            }
        );
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let classifier = ResponseClassifier::default();
        let mut body = html_page(10_000);
        body.extend_from_slice(b"<p>Please complete the CAPTCHA to continue</p>");
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "text/html")]),
            &body,
            body.len() as u64,
            Expect::Html,
        );
        assert_eq!(
            outcome,
            Outcome::BlockedCaptcha {
                signal: BlockSignal::Keyword("captcha".into())
            }
        );
    }

    #[test]
    fn keywords_beyond_sample_window_are_ignored() {
        let config = ClassifierConfig {
            body_sample_bytes: 1024,
            ..ClassifierConfig::default()
        };
        let classifier = ResponseClassifier::new(&config);
        let mut body = html_page(10_000);
        body.extend_from_slice(b"robot check");
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "text/html")]),
            &body,
            body.len() as u64,
            Expect::Html,
        );
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn missing_content_type_is_sniffed() {
        let classifier = ResponseClassifier::default();
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.resize(8_000, 0);
        let outcome = classifier.classify(200, &headers(&[]), &png, 8_000, Expect::Html);
        assert_eq!(
            outcome,
            Outcome::BlockedCaptcha {
                signal: BlockSignal::UnexpectedContentType("image/png".into())
            }
        );

        let page = html_page(8_000);
        assert_eq!(
            classifier.classify(200, &headers(&[]), &page, 8_000, Expect::Html),
            Outcome::Success
        );
    }

    #[test]
    fn expect_any_skips_content_heuristics() {
        let classifier = ResponseClassifier::default();
        let outcome = classifier.classify(
            200,
            &headers(&[("content-type", "application/pdf")]),
            b"%PDF-1.7",
            8,
            Expect::Any,
        );
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn textual_content_types() {
        assert!(is_textual("text/html"));
        assert!(is_textual("Text/HTML; charset=UTF-8"));
        assert!(is_textual("application/xhtml+xml"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/ld+json"));
        assert!(is_textual("application/javascript"));
        assert!(!is_textual("image/jpeg"));
        assert!(!is_textual("application/octet-stream"));
    }

    struct MaintenanceRule;

    impl ClassificationRule for MaintenanceRule {
        fn name(&self) -> &str {
            "maintenance"
        }

        fn evaluate(&self, response: &ResponseView<'_>) -> Option<Outcome> {
            response
                .header("x-maintenance")
                .map(|_| Outcome::RetryableServerError {
                    status: response.status,
                })
        }
    }

    #[test]
    fn operator_rules_run_after_builtins() {
        let classifier = ResponseClassifier::default().with_rule(MaintenanceRule);
        assert_eq!(classifier.rule_names().last(), Some(&"maintenance"));

        let body = html_page(10_000);
        let hdrs = headers(&[("content-type", "text/html"), ("X-Maintenance", "1")]);
        assert_eq!(
            classifier.classify(200, &hdrs, &body, 10_000, Expect::Html),
            Outcome::RetryableServerError { status: 200 }
        );
        // A built-in match still wins.
        assert_eq!(
            classifier.classify(403, &hdrs, &body, 10_000, Expect::Html),
            Outcome::BlockedUnknown { status: 403 }
        );
    }

    #[test]
    fn classification_is_total() {
        let classifier = ResponseClassifier::default();
        let bodies: [&[u8]; 4] = [b"", b"ok", b"captcha", &[0u8; 6000]];
        let types = [None, Some("text/html"), Some("image/gif"), Some("")];
        for status in [100u16, 200, 204, 301, 404, 403, 429, 500, 503, 599] {
            for ct in types {
                for body in bodies {
                    let hdrs = match ct {
                        Some(ct) => headers(&[("content-type", ct)]),
                        None => HashMap::new(),
                    };
                    for expect in [Expect::Html, Expect::Any] {
                        let _ = classifier.classify(status, &hdrs, body, body.len() as u64, expect);
                    }
                }
            }
        }
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(Outcome::BlockedCaptcha {
            signal: BlockSignal::Keyword("captcha".into()),
        })
        .unwrap();
        assert_eq!(json["kind"], "blocked_captcha");
        assert_eq!(json["signal"]["keyword"], "captcha");
    }
}
