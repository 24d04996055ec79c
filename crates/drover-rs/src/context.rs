//! Token-budgeted context window with chunked, cache-stable eviction.
//!
//! Each feedback loop owns exactly one [`ContextWindow`] for its lifetime.
//! The window tracks a running token estimate (chars-per-token heuristic)
//! against a budget; when an addition would exceed it, the oldest removable
//! turns are replaced with one-line placeholders in fixed-size chunks —
//! never one element at a time — so the model-side prompt cache is
//! invalidated rarely instead of on every call.
//!
//! Three regions are never touched:
//! - the sealed prefix (anchoring preamble up to the cache boundary), which
//!   must stay byte-identical across calls,
//! - turns of class [`TurnClass::Pinned`],
//! - the most recent `keep_recent` turns (immediate working memory).
//!
//! Eviction precedence follows [`TurnClass`]: large artifacts go first,
//! tool results next, textual reasoning last. When nothing removable
//! remains and the budget is still exceeded, the push fails with
//! [`EngineError::ContextOverflow`] — never silently ignored. The
//! over-budget turn is retained so the caller can summarize and rebuild.

use crate::error::EngineError;
use crate::{Turn, TurnClass};
use tracing::debug;

/// Conservative chars-per-token ratio for English text.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Prefix marking a turn whose content was evicted.
///
/// The compactor writes it and the candidate filter tests for it; sharing
/// one constant keeps the two from drifting apart.
pub const CLEARED_PREFIX: &str = "[Cleared:";

// ── Configuration ──────────────────────────────────────────────────

/// Compaction parameters for one window.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Token budget B for the whole window.
    pub budget_tokens: usize,
    /// The most recent M turns that are never evicted.
    pub keep_recent: usize,
    /// Turns evicted per chunk. Chunked eviction keeps the retained shape
    /// stable across many calls instead of shifting on every push.
    pub chunk_turns: usize,
    /// Characters per token for estimation.
    pub chars_per_token: f64,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 120_000,
            keep_recent: 5,
            chunk_turns: 4,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl CompactorConfig {
    pub fn new(budget_tokens: usize) -> Self {
        Self {
            budget_tokens,
            ..Default::default()
        }
    }

    pub fn with_keep_recent(mut self, turns: usize) -> Self {
        self.keep_recent = turns;
        self
    }

    pub fn with_chunk_turns(mut self, turns: usize) -> Self {
        self.chunk_turns = turns.max(1);
        self
    }
}

/// Snapshot of window usage at a point in time.
#[derive(Debug, Clone)]
pub struct ContextUsage {
    pub estimated_tokens: usize,
    pub budget_tokens: usize,
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.budget_tokens,
        )
    }
}

// ── ContextWindow ──────────────────────────────────────────────────

/// The token-budgeted conversation state owned by one feedback loop.
#[derive(Debug)]
pub struct ContextWindow {
    turns: Vec<Turn>,
    /// Index of the first turn past the sealed prefix. Turns below this
    /// index stay byte-identical for the lifetime of the window.
    cache_boundary: usize,
    config: CompactorConfig,
}

impl ContextWindow {
    pub fn new(config: CompactorConfig) -> Self {
        Self {
            turns: Vec::new(),
            cache_boundary: 0,
            config,
        }
    }

    /// Seal everything pushed so far as the stable prefix. Called once the
    /// anchoring preamble (system framing, task, injected lessons) is in
    /// place; the prefix is what the model-side prompt cache keys on.
    pub fn seal_prefix(&mut self) {
        self.cache_boundary = self.turns.len();
    }

    pub fn cache_boundary(&self) -> usize {
        self.cache_boundary
    }

    /// Concatenated content of the sealed prefix. Byte-identical across
    /// compactions — the cache-stability property.
    pub fn retained_prefix(&self) -> String {
        self.turns[..self.cache_boundary]
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Append a turn, compacting first if the addition would exceed the
    /// budget. On [`EngineError::ContextOverflow`] the turn is retained so
    /// the caller can summarize and rebuild; the window stays over budget
    /// until resolved.
    pub fn push(&mut self, turn: Turn) -> Result<(), EngineError> {
        self.turns.push(turn);
        if self.estimate_tokens() > self.config.budget_tokens {
            self.compact()?;
        }
        Ok(())
    }

    /// Evict removable turns in chunks, oldest and most-removable first,
    /// until the estimate fits the budget.
    fn compact(&mut self) -> Result<(), EngineError> {
        loop {
            let estimate = self.estimate_tokens();
            if estimate <= self.config.budget_tokens {
                return Ok(());
            }

            let mut candidates = self.evictable_indices();
            if candidates.is_empty() {
                return Err(EngineError::ContextOverflow {
                    needed: estimate,
                    budget: self.config.budget_tokens,
                });
            }

            candidates.truncate(self.config.chunk_turns);
            let evicted = candidates.len();
            let mut freed = 0usize;
            for index in candidates {
                let turn = &mut self.turns[index];
                let placeholder = format!(
                    "{CLEARED_PREFIX} {} {} turn — {} chars]",
                    class_label(turn.class),
                    turn.role,
                    turn.content.len(),
                );
                freed += turn.content.len().saturating_sub(placeholder.len());
                turn.content = placeholder;
            }
            debug!("evicted {evicted} turn(s), freed ~{freed} chars");
        }
    }

    /// Indices eligible for eviction, in eviction order: artifacts first,
    /// then tool results, then reasoning; oldest first within a class.
    fn evictable_indices(&self) -> Vec<usize> {
        let protected_tail = self.turns.len().saturating_sub(self.config.keep_recent);
        let mut indices: Vec<usize> = (self.cache_boundary..protected_tail)
            .filter(|&i| {
                let turn = &self.turns[i];
                turn.class != TurnClass::Pinned && !turn.content.starts_with(CLEARED_PREFIX)
            })
            .collect();
        indices.sort_by_key(|&i| (self.turns[i].class, i));
        indices
    }

    /// Estimated tokens across all turns.
    pub fn estimate_tokens(&self) -> usize {
        let total_chars: usize = self.turns.iter().map(|t| t.content.len()).sum();
        (total_chars as f64 / self.config.chars_per_token) as usize
    }

    pub fn usage(&self) -> ContextUsage {
        let estimated_tokens = self.estimate_tokens();
        let usage_pct = if self.config.budget_tokens > 0 {
            estimated_tokens as f64 / self.config.budget_tokens as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens,
            budget_tokens: self.config.budget_tokens,
            usage_pct,
        }
    }

    /// The turns, in order, for building a model request.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// A deep copy of the turns for an isolated subagent context slice.
    /// Never aliased — the child owns its copy outright.
    pub fn isolated_slice(&self) -> Vec<Turn> {
        self.turns.to_vec()
    }
}

fn class_label(class: TurnClass) -> &'static str {
    match class {
        TurnClass::Artifact => "artifact",
        TurnClass::ToolResult => "tool result",
        TurnClass::Reasoning => "reasoning",
        TurnClass::Pinned => "pinned",
    }
}
