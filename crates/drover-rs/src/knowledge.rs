//! Append-only knowledge store: patterns, lessons, and decisions from past
//! runs, searchable by keyword, tag, and recency.
//!
//! Entries are immutable once written. Each project gets its own JSONL file
//! under `<dir>/`; an in-memory cache behind an `RwLock` serves reads, so
//! queries on the hot path never block writers and may observe slightly
//! stale data — acceptable by design. Relevance is computed at query time,
//! never stored.
//!
//! Malformed lines found while loading are skipped with a warning rather
//! than halting — an unreadable lesson should not take the engine down with
//! it.

use crate::error::EngineError;
use crate::fresh_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Half-life of the recency component of the relevance score, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Weight of one keyword hit relative to one tag hit.
const KEYWORD_WEIGHT: f64 = 2.0;
const TAG_WEIGHT: f64 = 1.5;

/// Default caps for cross-project aggregation.
pub const DEFAULT_MAX_PROJECTS: usize = 10;
pub const DEFAULT_PER_PROJECT_LIMIT: usize = 5;

// ── Entry types ────────────────────────────────────────────────────

/// What kind of outcome an entry records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Pattern,
    LessonLearned,
    Decision,
    BestPractice,
    Context,
    Reference,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EntryKind::Pattern => "pattern",
            EntryKind::LessonLearned => "lesson_learned",
            EntryKind::Decision => "decision",
            EntryKind::BestPractice => "best_practice",
            EntryKind::Context => "context",
            EntryKind::Reference => "reference",
        };
        write!(f, "{label}")
    }
}

/// An immutable record of a past outcome.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub kind: EntryKind,
    pub content: String,
    pub tags: Vec<String>,
    pub task_ref: Option<String>,
    pub project: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a new entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub title: String,
    pub kind: EntryKind,
    pub content: String,
    pub tags: Vec<String>,
    pub task_ref: Option<String>,
    pub project: String,
}

impl NewEntry {
    pub fn new(title: impl Into<String>, kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind,
            content: content.into(),
            tags: Vec::new(),
            task_ref: None,
            project: "default".into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_task_ref(mut self, id: impl Into<String>) -> Self {
        self.task_ref = Some(id.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }
}

/// A search hit with its computed relevance.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: Arc<KnowledgeEntry>,
    pub score: f64,
}

// ── KnowledgeStore ─────────────────────────────────────────────────

/// The append-only store. One JSONL file per project, plus a shared
/// in-memory cache for reads.
pub struct KnowledgeStore {
    dir: PathBuf,
    cache: RwLock<Vec<Arc<KnowledgeEntry>>>,
}

impl KnowledgeStore {
    /// Open (or create) a store rooted at `dir`, loading every
    /// `<project>.jsonl` file found there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::StateCorruption(format!("cannot create knowledge dir: {e}"))
        })?;

        let mut cache = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            EngineError::StateCorruption(format!("cannot read knowledge dir: {e}"))
        })?;
        for file in entries {
            let file = file.map_err(|e| {
                EngineError::StateCorruption(format!("cannot read knowledge dir entry: {e}"))
            })?;
            let path = file.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            Self::load_file(&path, &mut cache);
        }
        cache.sort_by_key(|e| e.created_at);
        debug!("loaded {} knowledge entries from {}", cache.len(), dir.display());

        Ok(Self {
            dir,
            cache: RwLock::new(cache),
        })
    }

    fn load_file(path: &Path, cache: &mut Vec<Arc<KnowledgeEntry>>) {
        let Ok(content) = std::fs::read_to_string(path) else {
            warn!("skipping unreadable knowledge file {}", path.display());
            return;
        };
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KnowledgeEntry>(line) {
                Ok(entry) => cache.push(Arc::new(entry)),
                Err(e) => warn!("skipping malformed entry in {}: {e}", path.display()),
            }
        }
    }

    /// Append a new entry. The entry is on disk before the call returns and
    /// is never modified or deleted afterwards.
    pub fn add_entry(&self, new: NewEntry) -> Result<String, EngineError> {
        if new.title.trim().is_empty() || new.content.trim().is_empty() {
            return Err(EngineError::Validation(
                "knowledge entry needs a title and content".into(),
            ));
        }
        if new.project.trim().is_empty() {
            return Err(EngineError::Validation("empty project name".into()));
        }

        let entry = KnowledgeEntry {
            id: fresh_id("kn"),
            title: new.title,
            kind: new.kind,
            content: new.content,
            tags: new.tags,
            task_ref: new.task_ref,
            project: new.project,
            created_at: Utc::now(),
        };

        let path = self.dir.join(format!("{}.jsonl", entry.project));
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| EngineError::StateCorruption(format!("entry encode failed: {e}")))?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()).and_then(|()| f.sync_data()))
            .map_err(|e| EngineError::StateCorruption(format!("entry write failed: {e}")))?;

        let id = entry.id.clone();
        debug!("captured {} '{}' ({id})", entry.kind, entry.title);
        self.cache.write().unwrap().push(Arc::new(entry));
        Ok(id)
    }

    /// Search entries by keywords, optionally scoped to one project, ranked
    /// by keyword overlap, tag overlap, and recency. Ties break toward the
    /// more recent entry.
    pub fn search(
        &self,
        keywords: &[&str],
        project: Option<&str>,
        limit: usize,
    ) -> Vec<ScoredEntry> {
        let now = Utc::now();
        let cache = self.cache.read().unwrap();

        let mut hits: Vec<ScoredEntry> = cache
            .iter()
            .filter(|e| project.is_none_or(|p| e.project == p))
            .filter_map(|e| {
                let score = relevance(e, keywords, now);
                (score > 0.0).then(|| ScoredEntry {
                    entry: Arc::clone(e),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.entry.created_at.cmp(&a.entry.created_at))
        });
        hits.truncate(limit);
        hits
    }

    /// Aggregate search across the most recently active projects.
    pub fn cross_project_search(
        &self,
        keywords: &[&str],
        max_projects: usize,
        per_project_limit: usize,
    ) -> Vec<ScoredEntry> {
        // Rank projects by their most recent entry.
        let recent_projects: Vec<String> = {
            let cache = self.cache.read().unwrap();
            let mut latest: HashMap<&str, DateTime<Utc>> = HashMap::new();
            for entry in cache.iter() {
                let stamp = latest.entry(entry.project.as_str()).or_insert(entry.created_at);
                if entry.created_at > *stamp {
                    *stamp = entry.created_at;
                }
            }
            let mut projects: Vec<(&str, DateTime<Utc>)> = latest.into_iter().collect();
            projects.sort_by_key(|(_, stamp)| std::cmp::Reverse(*stamp));
            projects
                .into_iter()
                .take(max_projects)
                .map(|(p, _)| p.to_string())
                .collect()
        };

        let mut hits: Vec<ScoredEntry> = recent_projects
            .iter()
            .flat_map(|p| self.search(keywords, Some(p), per_project_limit))
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.entry.created_at.cmp(&a.entry.created_at))
        });
        hits
    }

    /// Entries that reference the given work item (dead-letter reporting).
    pub fn entries_for_task(&self, task_id: &str) -> Vec<Arc<KnowledgeEntry>> {
        self.cache
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.task_ref.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }

    /// Total entries currently cached.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Relevance scoring ──────────────────────────────────────────────

/// Relevance of one entry for a keyword set at a point in time.
///
/// `keyword_hits * 2.0 + tag_hits * 1.5 + recency`, where recency decays
/// exponentially with a 30-day half-life. Zero when nothing overlaps — the
/// recency term alone never makes an unrelated entry relevant.
pub fn relevance(entry: &KnowledgeEntry, keywords: &[&str], now: DateTime<Utc>) -> f64 {
    let haystack = format!("{} {}", entry.title, entry.content).to_lowercase();
    let keyword_hits = keywords
        .iter()
        .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
        .count();
    let tag_hits = entry
        .tags
        .iter()
        .filter(|t| {
            keywords
                .iter()
                .any(|k| !k.is_empty() && t.eq_ignore_ascii_case(k))
        })
        .count();

    if keyword_hits == 0 && tag_hits == 0 {
        return 0.0;
    }

    let age_days = (now - entry.created_at).num_seconds().max(0) as f64 / 86_400.0;
    let recency = 0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);

    keyword_hits as f64 * KEYWORD_WEIGHT + tag_hits as f64 * TAG_WEIGHT + recency
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KnowledgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn lesson(title: &str, content: &str) -> NewEntry {
        NewEntry::new(title, EntryKind::LessonLearned, content)
    }

    #[test]
    fn add_entry_validates_input() {
        let (_dir, store) = store();
        assert!(store.add_entry(lesson("", "content")).is_err());
        assert!(store.add_entry(lesson("title", "  ")).is_err());
    }

    #[test]
    fn search_matches_keywords_in_title_and_content() {
        let (_dir, store) = store();
        store
            .add_entry(lesson("port already bound", "kill the stale listener first"))
            .unwrap();
        store
            .add_entry(lesson("unrelated", "nothing to see"))
            .unwrap();

        let hits = store.search(&["listener"], None, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.title, "port already bound");
    }

    #[test]
    fn tags_contribute_to_score() {
        let (_dir, store) = store();
        store
            .add_entry(lesson("retry worked", "second attempt passed").with_tag("tool-execution"))
            .unwrap();
        store
            .add_entry(lesson("retry worked twice", "second attempt passed"))
            .unwrap();

        let hits = store.search(&["attempt", "tool-execution"], None, 10);
        assert_eq!(hits.len(), 2);
        // The tagged entry ranks first despite identical content overlap.
        assert_eq!(hits[0].entry.title, "retry worked");
    }

    #[test]
    fn identical_overlap_ranks_newer_first() {
        let (_dir, store) = store();
        let older = KnowledgeEntry {
            id: "kn-old".into(),
            title: "timeout fix".into(),
            kind: EntryKind::Pattern,
            content: "raise the act timeout".into(),
            tags: vec![],
            task_ref: None,
            project: "default".into(),
            created_at: Utc::now() - chrono::Duration::days(20),
        };
        let newer = KnowledgeEntry {
            created_at: Utc::now(),
            id: "kn-new".into(),
            ..older.clone()
        };

        let now = Utc::now();
        let score_old = relevance(&older, &["timeout"], now);
        let score_new = relevance(&newer, &["timeout"], now);
        assert!(
            score_new > score_old,
            "newer entry must outrank older on equal overlap"
        );
    }

    #[test]
    fn no_overlap_scores_zero() {
        let entry = KnowledgeEntry {
            id: "kn-1".into(),
            title: "gui focus".into(),
            kind: EntryKind::LessonLearned,
            content: "release the lock".into(),
            tags: vec!["gui".into()],
            task_ref: None,
            project: "default".into(),
            created_at: Utc::now(),
        };
        assert_eq!(relevance(&entry, &["database"], Utc::now()), 0.0);
    }

    #[test]
    fn project_scope_filters() {
        let (_dir, store) = store();
        store
            .add_entry(lesson("deploy failed", "missing env var").with_project("alpha"))
            .unwrap();
        store
            .add_entry(lesson("deploy failed", "missing env var").with_project("beta"))
            .unwrap();

        let hits = store.search(&["deploy"], Some("alpha"), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.project, "alpha");
    }

    #[test]
    fn cross_project_search_aggregates() {
        let (_dir, store) = store();
        for project in ["alpha", "beta", "gamma"] {
            for i in 0..3 {
                store
                    .add_entry(
                        lesson(&format!("flaky test {i}"), "rerun with isolation")
                            .with_project(project),
                    )
                    .unwrap();
            }
        }

        let hits = store.cross_project_search(&["flaky"], 2, 2);
        // 2 projects x 2 entries each.
        assert_eq!(hits.len(), 4);
        let projects: std::collections::HashSet<&str> =
            hits.iter().map(|h| h.entry.project.as_str()).collect();
        assert_eq!(projects.len(), 2);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = KnowledgeStore::open(dir.path()).unwrap();
            id = store
                .add_entry(lesson("persisted", "still here").with_tag("durability"))
                .unwrap();
        }
        let store = KnowledgeStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        let hits = store.search(&["persisted"], None, 10);
        assert_eq!(hits[0].entry.id, id);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KnowledgeStore::open(dir.path()).unwrap();
            store.add_entry(lesson("good", "entry")).unwrap();
        }
        // Corrupt the file with one bad line; the good entry still loads.
        let path = dir.path().join("default.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("}{ not jsonl\n");
        std::fs::write(&path, content).unwrap();

        let store = KnowledgeStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn entries_for_task_lookup() {
        let (_dir, store) = store();
        store
            .add_entry(lesson("lesson", "for task").with_task_ref("wk-42"))
            .unwrap();
        store.add_entry(lesson("other", "entry")).unwrap();

        let linked = store.entries_for_task("wk-42");
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].title, "lesson");
    }

    #[test]
    fn limit_truncates_results() {
        let (_dir, store) = store();
        for i in 0..10 {
            store
                .add_entry(lesson(&format!("match {i}"), "keyword target"))
                .unwrap();
        }
        assert_eq!(store.search(&["keyword"], None, 3).len(), 3);
    }
}
