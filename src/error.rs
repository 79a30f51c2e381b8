//! Error taxonomy for the collection core.
//!
//! Every failure that crosses a module boundary is one of these kinds; the
//! retry engine, circuit breaker and error handler all dispatch on the kind
//! rather than on source types, so upstream library errors are classified
//! once, at the edge where they occur.

use std::time::Duration;
use thiserror::Error;

/// Closed set of failure kinds observed by the collection core.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Upstream `429`. Carries the parsed `Retry-After` when present.
    #[error("rate limited by upstream{}", retry_after_suffix(.retry_after))]
    RateLimit { retry_after: Option<Duration> },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// `401`/`403`. Never retried.
    #[error("authentication rejected (status {status})")]
    Authentication { status: u16 },

    /// Upstream `5xx`.
    #[error("server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Malformed JSON or an unexpected payload shape.
    #[error("failed to parse upstream payload: {0}")]
    Parsing(String),

    /// Semantically bad row (e.g. a candle with `high < low`).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fail-fast result while a breaker is open; no outbound call was made.
    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: &'static str },

    /// Uniqueness violation; expected under the dedup contract.
    #[error("database constraint violated: {0}")]
    DatabaseConstraint(String),

    #[error("database connection failed: {0}")]
    DatabaseConnection(String),

    #[error("database operation timed out: {0}")]
    DatabaseTimeout(String),

    #[error("database locked: {0}")]
    DatabaseLock(String),

    /// Bad configuration detected at startup. Aborts the process.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("system resource exhausted: {0}")]
    SystemResource(String),

    #[error("unclassified error: {0}")]
    Unknown(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Log/alert severity derived from the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl HarvestError {
    /// Stable name used in structured log records and alert metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::RateLimit { .. } => "rate_limit",
            HarvestError::Connection(_) => "connection",
            HarvestError::Timeout(_) => "timeout",
            HarvestError::Authentication { .. } => "authentication",
            HarvestError::ServerError { .. } => "server_error",
            HarvestError::Parsing(_) => "parsing",
            HarvestError::Validation(_) => "validation",
            HarvestError::CircuitOpen { .. } => "circuit_open",
            HarvestError::DatabaseConstraint(_) => "database_constraint",
            HarvestError::DatabaseConnection(_) => "database_connection",
            HarvestError::DatabaseTimeout(_) => "database_timeout",
            HarvestError::DatabaseLock(_) => "database_lock",
            HarvestError::Configuration(_) => "configuration",
            HarvestError::SystemResource(_) => "system_resource",
            HarvestError::Unknown(_) => "unknown",
        }
    }

    /// Whether the retry engine may re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarvestError::RateLimit { .. }
                | HarvestError::Connection(_)
                | HarvestError::Timeout(_)
                | HarvestError::ServerError { .. }
                | HarvestError::DatabaseConnection(_)
                | HarvestError::DatabaseTimeout(_)
                | HarvestError::DatabaseLock(_)
        )
    }

    /// Whether this failure advances the upstream circuit breaker. Client
    /// mistakes and validation problems never trip it.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            HarvestError::Connection(_) | HarvestError::Timeout(_) | HarvestError::ServerError { .. }
        )
    }

    pub fn severity(&self) -> Severity {
        match self {
            HarvestError::Authentication { .. }
            | HarvestError::Configuration(_)
            | HarvestError::SystemResource(_) => Severity::Critical,
            HarvestError::Connection(_)
            | HarvestError::Timeout(_)
            | HarvestError::ServerError { .. }
            | HarvestError::CircuitOpen { .. }
            | HarvestError::DatabaseConnection(_)
            | HarvestError::DatabaseTimeout(_)
            | HarvestError::DatabaseLock(_) => Severity::Error,
            HarvestError::RateLimit { .. }
            | HarvestError::Parsing(_)
            | HarvestError::Validation(_)
            | HarvestError::DatabaseConstraint(_)
            | HarvestError::Unknown(_) => Severity::Warning,
        }
    }

    /// `Retry-After` carried by a rate-limit error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HarvestError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a transport-level failure from the HTTP client.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HarvestError::Timeout(err.to_string())
        } else if err.is_connect() {
            HarvestError::Connection(err.to_string())
        } else if err.is_decode() {
            HarvestError::Parsing(err.to_string())
        } else {
            HarvestError::Connection(err.to_string())
        }
    }

    /// Classify an HTTP status that was not a success. `Retry-After` must be
    /// parsed by the caller, which still holds the response headers.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => HarvestError::RateLimit { retry_after },
            401 | 403 => HarvestError::Authentication { status },
            s if s >= 500 => HarvestError::ServerError { status: s, message },
            _ => HarvestError::Unknown(format!("unexpected status {status}: {message}")),
        }
    }

    /// Classify a database-layer failure.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let msg = db.message().to_string();
                let lowered = msg.to_lowercase();
                if db.is_unique_violation() || lowered.contains("unique") {
                    HarvestError::DatabaseConstraint(msg)
                } else if lowered.contains("locked") || lowered.contains("busy") {
                    HarvestError::DatabaseLock(msg)
                } else {
                    HarvestError::Unknown(msg)
                }
            }
            sqlx::Error::PoolTimedOut => HarvestError::DatabaseTimeout(err.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                HarvestError::DatabaseConnection(err.to_string())
            }
            _ => HarvestError::Unknown(err.to_string()),
        }
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_matches_taxonomy() {
        assert!(HarvestError::RateLimit { retry_after: None }.is_transient());
        assert!(HarvestError::Connection("dns".into()).is_transient());
        assert!(HarvestError::Timeout("30s".into()).is_transient());
        assert!(HarvestError::ServerError {
            status: 503,
            message: "down".into()
        }
        .is_transient());
        assert!(HarvestError::DatabaseLock("busy".into()).is_transient());

        assert!(!HarvestError::Authentication { status: 401 }.is_transient());
        assert!(!HarvestError::Parsing("bad json".into()).is_transient());
        assert!(!HarvestError::Validation("high < low".into()).is_transient());
        assert!(!HarvestError::CircuitOpen { endpoint: "ohlcv" }.is_transient());
        assert!(!HarvestError::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn breaker_counts_only_server_side_kinds() {
        assert!(HarvestError::Connection("x".into()).counts_toward_breaker());
        assert!(HarvestError::Timeout("x".into()).counts_toward_breaker());
        assert!(HarvestError::ServerError {
            status: 500,
            message: "x".into()
        }
        .counts_toward_breaker());

        assert!(!HarvestError::RateLimit { retry_after: None }.counts_toward_breaker());
        assert!(!HarvestError::Validation("x".into()).counts_toward_breaker());
        assert!(!HarvestError::Authentication { status: 403 }.counts_toward_breaker());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            HarvestError::from_status(429, String::new(), Some(Duration::from_secs(30)))
                .retry_after(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            HarvestError::from_status(401, String::new(), None).kind(),
            "authentication"
        );
        assert_eq!(
            HarvestError::from_status(502, "bad gateway".into(), None).kind(),
            "server_error"
        );
    }

    #[test]
    fn severity_ranks_critical_kinds() {
        assert_eq!(
            HarvestError::Authentication { status: 401 }.severity(),
            Severity::Critical
        );
        assert_eq!(
            HarvestError::Configuration("x".into()).severity(),
            Severity::Critical
        );
        assert_eq!(
            HarvestError::Validation("x".into()).severity(),
            Severity::Warning
        );
        assert_eq!(
            HarvestError::Timeout("x".into()).severity(),
            Severity::Error
        );
    }
}
