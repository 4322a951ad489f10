//! Secret redaction boundary
//!
//! Every byte that reaches durable storage (run store, run log fields,
//! evidence bundle, committed manifest) passes through this module first.
//! Redaction happens once, at write time. Nothing here is applied on read.
//!
//! Two independent mechanisms:
//! - credential-shaped substrings are replaced with [`REDACTED`]
//! - structured fields whose *key* looks sensitive are replaced wholesale

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Literal marker substituted for every redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a structured field as sensitive.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "auth",
    "key",
    "credential",
];

struct SecretPattern {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

impl SecretPattern {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("invalid secret pattern"),
            replacement,
        }
    }
}

// Order matters: token formats first, structural patterns after. Every
// replacement keeps its prefix and only introduces the marker, which no
// pattern matches as a secret, so a second pass is a no-op.
static SECRET_PATTERNS: LazyLock<Vec<SecretPattern>> = LazyLock::new(|| {
    vec![
        SecretPattern::new("anthropic_api_key", r"sk-ant-[A-Za-z0-9\-_]{20,}", REDACTED),
        SecretPattern::new("openai_project_key", r"sk-proj-[A-Za-z0-9\-_]{20,}", REDACTED),
        SecretPattern::new("openai_api_key", r"sk-[A-Za-z0-9]{20,}", REDACTED),
        SecretPattern::new("github_fine_grained_pat", r"github_pat_[A-Za-z0-9_]{20,}", REDACTED),
        SecretPattern::new("github_token", r"gh[pousr]_[A-Za-z0-9]{20,}", REDACTED),
        SecretPattern::new("aws_access_key", r"AKIA[0-9A-Z]{16}", REDACTED),
        SecretPattern::new(
            "basic_auth_header",
            r"(?i)(authorization:\s*basic\s+)[A-Za-z0-9+/]+={0,2}",
            "${1}[REDACTED]",
        ),
        SecretPattern::new(
            "bearer_token",
            r"(?i)(\bbearer\s+)[A-Za-z0-9\-._~+/]{8,}=*",
            "${1}[REDACTED]",
        ),
        SecretPattern::new(
            "url_credentials",
            r"(?i)\b([a-z][a-z0-9+.\-]*://)[^\s/@:]+:[^\s/@]+@",
            "${1}[REDACTED]@",
        ),
        SecretPattern::new(
            "token_query_param",
            r#"(?i)([?&](?:access_token|refresh_token|id_token|private_token|token|api_key|apikey|key|client_secret|secret|password|passwd|auth|sig|signature)=)[^&\s#"']+"#,
            "${1}[REDACTED]",
        ),
        SecretPattern::new(
            "secret_assignment",
            r#"(?i)(api[_-]?key|access[_-]?token|auth[_-]?token|client[_-]?secret|secret[_-]?key|password|passwd)(\\?["']?\s*[:=]\s*\\?["']?)[^\s"'&,;\\]+"#,
            "${1}${2}[REDACTED]",
        ),
    ]
});

/// Redact credential-shaped substrings from a string.
pub fn redact_str(input: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(input);
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.regex.is_match(&result) {
            tracing::trace!(pattern = pattern.name, "secret pattern matched");
            result = Cow::Owned(
                pattern
                    .regex
                    .replace_all(&result, pattern.replacement)
                    .into_owned(),
            );
        }
    }
    result
}

/// Whether a structured field name marks its value as sensitive.
///
/// Also used for environment variable names handed to child processes.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Redact a JSON value: sensitive keys are replaced wholesale, strings are
/// pattern-filtered, other scalars pass through unchanged.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_value(inner))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A value that has passed through the redaction filter.
///
/// Only this module can construct one, so any API that takes a
/// `Redacted<_>` cannot be handed raw text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Redacted<T>(T);

impl Redacted<String> {
    pub fn text(input: &str) -> Self {
        Self(redact_str(input).into_owned())
    }

    /// Redact the `Display` rendering of an error, including its cause chain
    /// when it is an `anyhow::Error` formatted with `{:#}` by the caller.
    pub fn display(value: &dyn std::fmt::Display) -> Self {
        Self::text(&value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Redacted<Value> {
    pub fn value(input: &Value) -> Self {
        Self(redact_value(input))
    }

    /// Serialize then redact. Serialization failures become a marker string
    /// rather than leaking a partially rendered value.
    pub fn serialize<T: Serialize + ?Sized>(input: &T) -> Self {
        match serde_json::to_value(input) {
            Ok(value) => Self::value(&value),
            Err(_) => Self(Value::String("(unserializable detail)".to_string())),
        }
    }

    /// Pretty-printed JSON of the already redacted value. Text filtering is
    /// never applied to serialized JSON, where escaped quotes defeat it.
    pub fn to_pretty(&self) -> Redacted<String> {
        Redacted(serde_json::to_string_pretty(&self.0).unwrap_or_default())
    }
}

impl<T> Redacted<T> {
    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}
