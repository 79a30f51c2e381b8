//! Central failure dispatcher.
//!
//! Every failure a collector surfaces flows through [`ErrorHandler::handle`]
//! with its component/operation context. The handler classifies the error,
//! asks the first matching registered [`RecoveryStrategy`] for a decision,
//! emits one structured log record at the severity the classification
//! implies, and writes a system-alert row when the decision calls for one.
//! New strategies register without touching the dispatcher.

use crate::error::{HarvestError, Severity};
use crate::models::{AlertLevel, SystemAlert};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Context the failing call site provides.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub collector_key: Option<String>,
    /// 1-indexed attempt that failed.
    pub attempt: u32,
    pub max_retries: u32,
}

impl ErrorContext {
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            collector_key: None,
            attempt: 1,
            max_retries: 0,
        }
    }

    pub fn collector(mut self, key: &str) -> Self {
        self.collector_key = Some(key.to_string());
        self
    }

    pub fn attempts(mut self, attempt: u32, max_retries: u32) -> Self {
        self.attempt = attempt;
        self.max_retries = max_retries;
        self
    }
}

/// What the dispatcher decided about a failure.
#[derive(Debug, Clone)]
pub struct RecoveryDecision {
    /// The operation may be considered handled; the caller continues.
    pub recovered: bool,
    /// Batch callers may keep rows that survived.
    pub allow_partial: bool,
    /// Wait this long before the next attempt, when retrying at all.
    pub retry_after: Option<Duration>,
    pub should_alert: bool,
    pub alert_level: AlertLevel,
    pub strategy: &'static str,
    pub message: String,
}

pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn handles(&self, error: &HarvestError) -> bool;
    fn decide(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision;
}

// === Built-in strategies ===

/// Wait out a rate limit and retry; `Retry-After` is authoritative.
struct RateLimitWait;

impl RecoveryStrategy for RateLimitWait {
    fn name(&self) -> &'static str {
        "rate_limit_wait"
    }

    fn handles(&self, error: &HarvestError) -> bool {
        matches!(error, HarvestError::RateLimit { .. })
    }

    fn decide(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        RecoveryDecision {
            recovered: cx.attempt <= cx.max_retries,
            allow_partial: false,
            retry_after: error.retry_after(),
            should_alert: false,
            alert_level: AlertLevel::Warning,
            strategy: self.name(),
            message: format!("{} rate limited during {}", cx.component, cx.operation),
        }
    }
}

/// Transient transport/server/database failures back off and retry; an
/// exhausted retry budget escalates to an alert.
struct RetryWithBackoff;

impl RecoveryStrategy for RetryWithBackoff {
    fn name(&self) -> &'static str {
        "retry_with_backoff"
    }

    fn handles(&self, error: &HarvestError) -> bool {
        error.is_transient() && !matches!(error, HarvestError::RateLimit { .. })
    }

    fn decide(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        let exhausted = cx.attempt > cx.max_retries;
        RecoveryDecision {
            recovered: !exhausted,
            allow_partial: false,
            retry_after: None,
            should_alert: exhausted,
            alert_level: AlertLevel::Error,
            strategy: self.name(),
            message: format!(
                "{} failed during {} ({}), attempt {}/{}",
                cx.component,
                cx.operation,
                error.kind(),
                cx.attempt,
                cx.max_retries + 1
            ),
        }
    }
}

/// Bad rows drop out of a batch; the rest of the batch survives.
struct PartialSuccess;

impl RecoveryStrategy for PartialSuccess {
    fn name(&self) -> &'static str {
        "partial_success"
    }

    fn handles(&self, error: &HarvestError) -> bool {
        matches!(
            error,
            HarvestError::Parsing(_) | HarvestError::Validation(_)
        )
    }

    fn decide(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        RecoveryDecision {
            recovered: true,
            allow_partial: true,
            retry_after: None,
            should_alert: false,
            alert_level: AlertLevel::Warning,
            strategy: self.name(),
            message: format!("{} dropped rows during {}: {}", cx.component, cx.operation, error),
        }
    }
}

/// Uniqueness conflicts are the dedup contract working as intended.
struct SkipDuplicate;

impl RecoveryStrategy for SkipDuplicate {
    fn name(&self) -> &'static str {
        "skip_duplicate"
    }

    fn handles(&self, error: &HarvestError) -> bool {
        matches!(error, HarvestError::DatabaseConstraint(_))
    }

    fn decide(&self, _error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        RecoveryDecision {
            recovered: true,
            allow_partial: true,
            retry_after: None,
            should_alert: false,
            alert_level: AlertLevel::Warning,
            strategy: self.name(),
            message: format!(
                "{} skipped duplicate rows during {}",
                cx.component, cx.operation
            ),
        }
    }
}

/// Everything else fails fast; critical kinds always alert.
struct FailFast;

impl RecoveryStrategy for FailFast {
    fn name(&self) -> &'static str {
        "fail_fast"
    }

    fn handles(&self, _error: &HarvestError) -> bool {
        true
    }

    fn decide(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        let severity = error.severity();
        RecoveryDecision {
            recovered: false,
            allow_partial: false,
            retry_after: None,
            should_alert: severity >= Severity::Error,
            alert_level: match severity {
                Severity::Critical => AlertLevel::Critical,
                Severity::Error => AlertLevel::Error,
                Severity::Warning => AlertLevel::Warning,
            },
            strategy: self.name(),
            message: format!("{} failed during {}: {}", cx.component, cx.operation, error),
        }
    }
}

/// Strategy-dispatching failure handler shared by every collector.
pub struct ErrorHandler {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    storage: Arc<Storage>,
}

impl ErrorHandler {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            strategies: vec![
                Box::new(RateLimitWait),
                Box::new(RetryWithBackoff),
                Box::new(PartialSuccess),
                Box::new(SkipDuplicate),
                // Catch-all; must stay last.
                Box::new(FailFast),
            ],
            storage,
        }
    }

    /// Insert a strategy ahead of the built-in catch-all.
    pub fn register(&mut self, strategy: Box<dyn RecoveryStrategy>) {
        let last = self.strategies.len().saturating_sub(1);
        self.strategies.insert(last, strategy);
    }

    /// Classify, decide, log, and (when warranted) write an alert row.
    pub async fn handle(&self, error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.handles(error))
            .expect("fail-fast catch-all always matches");
        let decision = strategy.decide(error, cx);

        match error.severity() {
            Severity::Critical | Severity::Error => error!(
                component = %cx.component,
                operation = %cx.operation,
                error_type = error.kind(),
                severity = ?error.severity(),
                retry_count = cx.attempt.saturating_sub(1),
                strategy = decision.strategy,
                "{}",
                decision.message
            ),
            Severity::Warning => warn!(
                component = %cx.component,
                operation = %cx.operation,
                error_type = error.kind(),
                severity = ?error.severity(),
                retry_count = cx.attempt.saturating_sub(1),
                strategy = decision.strategy,
                "{}",
                decision.message
            ),
        }

        if decision.should_alert {
            let alert = SystemAlert::new(
                decision.alert_level,
                cx.collector_key.as_deref(),
                &decision.message,
            )
            .with_metadata(serde_json::json!({
                "component": cx.component,
                "operation": cx.operation,
                "error_type": error.kind(),
                "attempt": cx.attempt,
            }));
            if let Err(e) = self.storage.insert_alert(&alert).await {
                // Alerting must never take the collector down with it.
                warn!(error = %e, "failed to persist system alert");
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide_with(error: &HarvestError, cx: &ErrorContext) -> RecoveryDecision {
        let strategies: Vec<Box<dyn RecoveryStrategy>> = vec![
            Box::new(RateLimitWait),
            Box::new(RetryWithBackoff),
            Box::new(PartialSuccess),
            Box::new(SkipDuplicate),
            Box::new(FailFast),
        ];
        strategies
            .iter()
            .find(|s| s.handles(error))
            .unwrap()
            .decide(error, cx)
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let cx = ErrorContext::new("ohlcv_collector", "fetch").attempts(1, 3);
        let decision = decide_with(
            &HarvestError::RateLimit {
                retry_after: Some(Duration::from_secs(30)),
            },
            &cx,
        );
        assert_eq!(decision.strategy, "rate_limit_wait");
        assert!(decision.recovered);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(30)));
        assert!(!decision.should_alert);
    }

    #[test]
    fn exhausted_transient_failures_alert() {
        let cx = ErrorContext::new("trade_collector", "fetch").attempts(4, 3);
        let decision = decide_with(
            &HarvestError::ServerError {
                status: 503,
                message: "down".into(),
            },
            &cx,
        );
        assert_eq!(decision.strategy, "retry_with_backoff");
        assert!(!decision.recovered);
        assert!(decision.should_alert);
        assert_eq!(decision.alert_level, AlertLevel::Error);
    }

    #[test]
    fn validation_errors_keep_partial_batches() {
        let cx = ErrorContext::new("ohlcv_collector", "validate");
        let decision = decide_with(&HarvestError::Validation("high < low".into()), &cx);
        assert_eq!(decision.strategy, "partial_success");
        assert!(decision.recovered);
        assert!(decision.allow_partial);
    }

    #[test]
    fn duplicates_are_silent() {
        let cx = ErrorContext::new("storage", "insert_candles");
        let decision = decide_with(&HarvestError::DatabaseConstraint("unique".into()), &cx);
        assert_eq!(decision.strategy, "skip_duplicate");
        assert!(decision.recovered);
        assert!(!decision.should_alert);
    }

    #[test]
    fn authentication_fails_fast_and_alerts_critical() {
        let cx = ErrorContext::new("api", "token_info");
        let decision = decide_with(&HarvestError::Authentication { status: 401 }, &cx);
        assert_eq!(decision.strategy, "fail_fast");
        assert!(!decision.recovered);
        assert!(decision.should_alert);
        assert_eq!(decision.alert_level, AlertLevel::Critical);
    }

    #[test]
    fn unknown_errors_fail_fast_without_alert() {
        let cx = ErrorContext::new("api", "parse");
        let decision = decide_with(&HarvestError::Unknown("odd".into()), &cx);
        assert_eq!(decision.strategy, "fail_fast");
        assert!(!decision.should_alert);
    }
}
