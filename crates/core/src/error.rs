use std::fmt;
use std::time::Duration;
use thiserror::Error;

const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    Auth,
    RateLimit,
    Timeout,
    Server,
    BadRequest,
}

impl ProviderErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Server)
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            429 => Self::RateLimit,
            408 | 504 => Self::Timeout,
            500..=599 => Self::Server,
            _ => Self::BadRequest,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate-limit",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::BadRequest => "bad-request",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{provider} {kind} error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, provider: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: sanitize_message(message.as_ref()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn from_reqwest(provider: &str, error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ProviderErrorKind::Timeout
        } else if let Some(status) = error.status() {
            ProviderErrorKind::from_status(status.as_u16())
        } else if error.is_connect() || error.is_request() {
            ProviderErrorKind::Server
        } else {
            ProviderErrorKind::BadRequest
        };
        // reqwest messages may embed the request url, which can carry a key.
        Self::new(kind, provider, error.without_url().to_string())
    }
}

/// Masks credentials and truncates vendor text before it can reach a caller or a log line.
pub fn sanitize_message(raw: &str) -> String {
    let masked = raw
        .split_whitespace()
        .map(|word| {
            let looks_secret = word.starts_with("sk-")
                || word.starts_with("ghp_")
                || word.starts_with("glpat-")
                || word.contains("x-access-token:")
                || word.contains("oauth2:");
            if looks_secret {
                "[redacted]"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let masked = mask_after(&masked, "Bearer ");

    if masked.chars().count() > MAX_MESSAGE_CHARS {
        let truncated: String = masked.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{truncated}…")
    } else {
        masked
    }
}

fn mask_after(text: &str, marker: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(position) = rest.find(marker) {
        out.push_str(&rest[..position + marker.len()]);
        rest = &rest[position + marker.len()..];
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end > 0 {
            out.push_str("[redacted]");
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("repository access denied: {0}")]
    Auth(String),

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("repository host rate limited the request: {0}")]
    RateLimit(String),

    #[error("repository fetch failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("input error: {0}")]
    Input(String),

    #[error("input has {tokens} tokens, provider ceiling is {ceiling}")]
    Capacity { tokens: usize, ceiling: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("vector dimension {actual} does not match store dimension {expected}")]
    Consistency { expected: usize, actual: usize },

    #[error("invalid state: {0}")]
    State(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl RagError {
    /// Message safe to show an end user; provider detail is already sanitized.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(error) => match error.kind {
                ProviderErrorKind::Auth => {
                    format!("the {} provider rejected the configured credentials", error.provider)
                }
                ProviderErrorKind::RateLimit => {
                    format!("the {} provider is rate limiting requests, try again later", error.provider)
                }
                ProviderErrorKind::Timeout => format!("the {} provider timed out", error.provider),
                ProviderErrorKind::Server => {
                    format!("the {} provider is unavailable", error.provider)
                }
                ProviderErrorKind::BadRequest => {
                    format!("the {} provider could not process the request: {}", error.provider, error.message)
                }
            },
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(ProviderErrorKind::from_status(401), ProviderErrorKind::Auth);
        assert_eq!(ProviderErrorKind::from_status(403), ProviderErrorKind::Auth);
        assert_eq!(ProviderErrorKind::from_status(429), ProviderErrorKind::RateLimit);
        assert_eq!(ProviderErrorKind::from_status(504), ProviderErrorKind::Timeout);
        assert_eq!(ProviderErrorKind::from_status(502), ProviderErrorKind::Server);
        assert_eq!(ProviderErrorKind::from_status(422), ProviderErrorKind::BadRequest);
    }

    #[test]
    fn only_rate_limit_timeout_and_server_are_transient() {
        assert!(ProviderErrorKind::RateLimit.is_transient());
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(ProviderErrorKind::Server.is_transient());
        assert!(!ProviderErrorKind::Auth.is_transient());
        assert!(!ProviderErrorKind::BadRequest.is_transient());
    }

    #[test]
    fn secrets_are_masked_and_long_bodies_truncated() {
        let message = sanitize_message("invalid key sk-abc123 sent with Authorization: Bearer xyz");
        assert!(!message.contains("sk-abc123"));
        assert!(!message.contains("xyz"));

        let long = "x".repeat(1_000);
        assert!(sanitize_message(&long).chars().count() <= MAX_MESSAGE_CHARS + 1);
    }

    #[test]
    fn user_message_hides_auth_detail() {
        let error = RagError::from(ProviderError::new(
            ProviderErrorKind::Auth,
            "openai",
            "incorrect api key provided: sk-live-123",
        ));
        let shown = error.user_message();
        assert!(shown.contains("openai"));
        assert!(!shown.contains("sk-live"));
    }
}
