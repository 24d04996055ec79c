//! Error taxonomy and retry classification.
//!
//! Every failure that crosses a component boundary is classified into one of
//! the [`EngineError`] variants before the feedback loop's verify/retry
//! decision sees it. The classification determines three things: whether the
//! error is retryable at all, whether a retry consumes the item's bounded
//! retry budget, and which category keyword the knowledge store is searched
//! under when looking for lessons from similar past failures.

use thiserror::Error;

/// The engine-wide error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input — surfaced immediately, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Rate limit or timeout from the model service — retried with
    /// exponential backoff, bounded attempts.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// A capability call failed — becomes a verify failure and feeds the
    /// retry path.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// A declared shared resource was unavailable — requeued with jittered
    /// backoff; does not consume retry budget.
    #[error("resource contention: {0}")]
    ResourceContention(String),

    /// Persisted queue, transcript, or context state is inconsistent at
    /// recovery time — halts startup, surfaced for manual intervention.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// A context window cannot fit within its budget even after evicting
    /// everything removable. Never silently ignored.
    #[error("context overflow: need ~{needed} tokens, budget {budget}")]
    ContextOverflow { needed: usize, budget: usize },
}

impl EngineError {
    /// Whether this failure should be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBackend(_)
                | EngineError::ToolExecution(_)
                | EngineError::ResourceContention(_)
        )
    }

    /// Whether a retry of this failure consumes the item's retry budget.
    ///
    /// Contention on a declared shared resource is requeued for free — the
    /// work was never attempted.
    pub fn consumes_retry_budget(&self) -> bool {
        matches!(
            self,
            EngineError::TransientBackend(_) | EngineError::ToolExecution(_)
        )
    }

    /// Whether this error must halt the process (exit code 2).
    pub fn is_fatal_corruption(&self) -> bool {
        matches!(self, EngineError::StateCorruption(_))
    }

    /// Stable category keyword used when searching the knowledge store for
    /// similar past failures.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::TransientBackend(_) => "transient-backend",
            EngineError::ToolExecution(_) => "tool-execution",
            EngineError::ResourceContention(_) => "resource-contention",
            EngineError::StateCorruption(_) => "state-corruption",
            EngineError::ContextOverflow { .. } => "context-overflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_never_retried() {
        let err = EngineError::Validation("empty description".into());
        assert!(!err.is_retryable());
        assert!(!err.consumes_retry_budget());
    }

    #[test]
    fn transient_and_tool_errors_consume_budget() {
        assert!(EngineError::TransientBackend("429".into()).consumes_retry_budget());
        assert!(EngineError::ToolExecution("exit 1".into()).consumes_retry_budget());
    }

    #[test]
    fn contention_retries_for_free() {
        let err = EngineError::ResourceContention("gui focus held".into());
        assert!(err.is_retryable());
        assert!(!err.consumes_retry_budget());
    }

    #[test]
    fn corruption_is_fatal_and_not_retryable() {
        let err = EngineError::StateCorruption("bad journal line".into());
        assert!(err.is_fatal_corruption());
        assert!(!err.is_retryable());
    }

    #[test]
    fn categories_are_stable_keywords() {
        assert_eq!(
            EngineError::ToolExecution("x".into()).category(),
            "tool-execution"
        );
        assert_eq!(
            EngineError::ContextOverflow {
                needed: 10,
                budget: 5
            }
            .category(),
            "context-overflow"
        );
    }

    #[test]
    fn overflow_message_names_both_numbers() {
        let err = EngineError::ContextOverflow {
            needed: 1200,
            budget: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1200"));
        assert!(msg.contains("1000"));
    }
}
