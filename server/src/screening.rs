//! Screening pipeline — coarse metadata classification and filtering.
//!
//! Consumes scan events from the bounded scanner channel. Per candidate:
//! resolve extension → category through the mapping cache, evaluate filter
//! rules in descending priority (`exclude` short-circuits with no
//! persistence), then write the screening row idempotently. Only
//! `Inserted`/`Refreshed` outcomes emit `screening-result-updated`; an
//! unchanged fingerprint is silent.
//!
//! The rule/mapping cache is read-mostly and rebuilt on `database-updated`
//! notifications from the config queue, which also carry the stale subtrees
//! to prune after folder deletions.

use globset::Glob;
use mindex_core::error::StoreResult;
use mindex_core::types::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::events::{names, EventBus};
use crate::store::Store;
use crate::vector_index::VectorIndex;

// ---------------------------------------------------------------------------
// Rule cache
// ---------------------------------------------------------------------------

enum Matcher {
    Regex(regex::Regex),
    Glob(globset::GlobMatcher),
    Exact(String),
}

impl Matcher {
    fn compile(rule: &FilterRule) -> Option<Matcher> {
        match rule.pattern_type {
            PatternType::Regex => match regex::Regex::new(&rule.pattern) {
                Ok(re) => Some(Matcher::Regex(re)),
                Err(e) => {
                    warn!(rule = rule.name.as_str(), error = %e, "Bad regex rule skipped");
                    None
                }
            },
            PatternType::Glob => match Glob::new(&rule.pattern) {
                Ok(g) => Some(Matcher::Glob(g.compile_matcher())),
                Err(e) => {
                    warn!(rule = rule.name.as_str(), error = %e, "Bad glob rule skipped");
                    None
                }
            },
            PatternType::Exact => Some(Matcher::Exact(rule.pattern.to_lowercase())),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(value),
            Matcher::Glob(g) => g.is_match(value),
            Matcher::Exact(s) => value.to_lowercase() == *s,
        }
    }
}

struct CompiledRule {
    rule: FilterRule,
    matcher: Option<Matcher>,
    /// Parsed byte threshold for `Size` rules.
    size_threshold: Option<u64>,
}

impl CompiledRule {
    fn applies_to(&self, candidate: &FileCandidate) -> bool {
        match self.rule.rule_type {
            RuleType::Extension => {
                let ext = candidate.extension.as_deref().unwrap_or("");
                self.matcher.as_ref().is_some_and(|m| m.matches(ext))
            }
            RuleType::Filename => {
                self.matcher.as_ref().is_some_and(|m| m.matches(&candidate.name))
            }
            RuleType::Path => self.matcher.as_ref().is_some_and(|m| m.matches(&candidate.path)),
            // A size rule matches files larger than its threshold.
            RuleType::Size => self.size_threshold.is_some_and(|t| candidate.size > t),
        }
    }
}

/// Best mapping per extension plus compiled rules in evaluation order.
pub struct RuleCache {
    rules: Vec<CompiledRule>,
    categories: HashMap<String, i64>,
}

/// The screening verdict for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Exclude,
    Include { category_id: Option<i64> },
}

impl RuleCache {
    pub fn build(store: &Store) -> StoreResult<RuleCache> {
        // Priority tie-break: highest mapping priority wins; ties go to the
        // most recently created rule.
        let mut best: HashMap<String, ExtensionMapping> = HashMap::new();
        for m in store.list_mappings()? {
            match best.get(&m.extension) {
                Some(prev)
                    if (prev.priority, prev.created_at, prev.id)
                        >= (m.priority, m.created_at, m.id) => {}
                _ => {
                    best.insert(m.extension.clone(), m);
                }
            }
        }
        let categories = best.into_iter().map(|(ext, m)| (ext, m.category_id)).collect();

        let mut rules: Vec<CompiledRule> = store
            .list_rules()?
            .into_iter()
            .filter(|r| r.enabled)
            .map(|rule| {
                let size_threshold = match rule.rule_type {
                    RuleType::Size => rule.pattern.trim().parse::<u64>().ok(),
                    _ => None,
                };
                let matcher =
                    if rule.rule_type == RuleType::Size { None } else { Matcher::compile(&rule) };
                CompiledRule { rule, matcher, size_threshold }
            })
            .collect();
        rules.sort_by(|a, b| {
            b.rule.priority.cmp(&a.rule.priority).then(a.rule.id.cmp(&b.rule.id))
        });

        Ok(RuleCache { rules, categories })
    }

    pub fn category_for(&self, extension: Option<&str>) -> Option<i64> {
        self.categories.get(extension?).copied()
    }

    /// First matching rule wins; no match includes the file.
    pub fn decide(&self, candidate: &FileCandidate) -> Decision {
        let category_id = self.category_for(candidate.extension.as_deref());
        for compiled in &self.rules {
            if compiled.applies_to(candidate) {
                return match compiled.rule.action {
                    RuleAction::Exclude => Decision::Exclude,
                    RuleAction::Include => Decision::Include {
                        category_id: compiled.rule.category_id.or(category_id),
                    },
                };
            }
        }
        Decision::Include { category_id }
    }
}

// ---------------------------------------------------------------------------
// Content hashing (lazy — first full read happens in tagging)
// ---------------------------------------------------------------------------

/// Streaming sha256 of a file, hex-encoded.
pub fn content_hash_of(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Default seeds
// ---------------------------------------------------------------------------

/// First-run seeds: common categories, extension mappings, system filter
/// rules, and default bundle extensions. Idempotent.
pub fn seed_defaults(store: &Store) -> StoreResult<()> {
    if !store.list_categories()?.is_empty() {
        return Ok(());
    }

    let seeds: &[(&str, &str, &[&str])] = &[
        ("document", "Text documents", &["pdf", "md", "txt", "doc", "docx", "rtf", "epub"]),
        ("image", "Pictures", &["png", "jpg", "jpeg", "gif", "webp", "heic", "svg"]),
        ("audio", "Audio", &["mp3", "wav", "flac", "m4a", "ogg"]),
        ("video", "Video", &["mp4", "mov", "mkv", "avi", "webm"]),
        ("archive", "Archives", &["zip", "tar", "gz", "7z", "rar"]),
        ("code", "Source code", &["rs", "py", "js", "ts", "go", "java", "c", "cpp", "h"]),
        ("data", "Structured data", &["csv", "json", "xml", "yaml", "toml", "xlsx"]),
    ];
    for (name, description, extensions) in seeds {
        let category = store.upsert_category(name, None, Some(description))?;
        for ext in *extensions {
            store.add_mapping(ext, category.id, MappingPriority::Medium)?;
        }
    }

    store.add_rule(
        "hidden files",
        RuleType::Filename,
        r"^\..*",
        PatternType::Regex,
        RuleAction::Exclude,
        1_000,
        true,
        None,
    )?;
    store.add_rule(
        "oversized files",
        RuleType::Size,
        "1073741824",
        PatternType::Exact,
        RuleAction::Exclude,
        990,
        true,
        None,
    )?;
    store.add_rule(
        "temp files",
        RuleType::Extension,
        "tmp",
        PatternType::Exact,
        RuleAction::Exclude,
        980,
        true,
        None,
    )?;

    for bundle in ["app", "bundle", "framework", "photoslibrary"] {
        store.upsert_bundle_extension(bundle, true)?;
    }

    info!("Seeded default categories, rules, and bundle extensions");
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ScreeningPipeline {
    store: Arc<Store>,
    bus: EventBus,
    index: Arc<VectorIndex>,
    cache: Arc<RwLock<RuleCache>>,
    /// Screened rows headed for tagging.
    tagging_tx: SyncSender<ScreeningResult>,
}

impl ScreeningPipeline {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        index: Arc<VectorIndex>,
        tagging_tx: SyncSender<ScreeningResult>,
    ) -> StoreResult<Self> {
        let cache = Arc::new(RwLock::new(RuleCache::build(&store)?));
        Ok(Self { store, bus, index, cache, tagging_tx })
    }

    pub fn cache(&self) -> Arc<RwLock<RuleCache>> {
        Arc::clone(&self.cache)
    }

    pub fn refresh_cache(&self) -> StoreResult<()> {
        let rebuilt = RuleCache::build(&self.store)?;
        *self.cache.write().unwrap_or_else(|p| p.into_inner()) = rebuilt;
        Ok(())
    }

    /// Consume scan events until the channel closes. Run on a dedicated
    /// thread; per-file work stays cheap (no file bodies are read here).
    pub fn run(&self, rx: Receiver<crate::scan::ScanEvent>) {
        for event in rx {
            let outcome = match event {
                crate::scan::ScanEvent::Candidate(candidate) => self.process(&candidate),
                crate::scan::ScanEvent::Removed(path) => self.remove(&path),
            };
            if let Err(e) = outcome {
                if e.is_fatal() {
                    self.bus.emit(
                        names::API_ERROR,
                        serde_json::json!({ "code": "store_fatal", "message": e.to_string() }),
                    );
                    return;
                }
                warn!(error = %e, "Screening step failed");
            }
        }
        debug!("Scan channel closed; screening loop exiting");
    }

    pub fn process(&self, candidate: &FileCandidate) -> StoreResult<()> {
        let decision = {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            cache.decide(candidate)
        };
        let category_id = match decision {
            Decision::Exclude => {
                debug!(path = candidate.path.as_str(), "Excluded by filter rule");
                return Ok(());
            }
            Decision::Include { category_id } => category_id,
        };

        let (outcome, row) = self.store.upsert_screening(candidate, category_id)?;
        match outcome {
            ScreeningOutcome::Unchanged => {}
            ScreeningOutcome::Inserted | ScreeningOutcome::Refreshed => {
                if outcome == ScreeningOutcome::Refreshed {
                    self.invalidate_derived(&row)?;
                }
                self.bus.emit(
                    names::SCREENING_RESULT_UPDATED,
                    serde_json::json!({
                        "file_path": row.file_path,
                        "status": row.status.as_str(),
                        "category_id": row.category_id,
                    }),
                );
                // Oldest-wins: a full tagging queue drops this enqueue; the
                // row stays `new` and the next sweep retries it.
                if self.tagging_tx.try_send(row).is_err() {
                    debug!("Tagging queue full; deferring to next sweep");
                }
            }
        }
        Ok(())
    }

    /// A removed file transitions to `deleted` and loses its derived state.
    pub fn remove(&self, path: &str) -> StoreResult<()> {
        let Some(row) = self.store.get_screening(path)? else {
            return Ok(());
        };
        self.store.set_screening_status(path, ScreeningStatus::Deleted)?;
        self.invalidate_derived(&row)?;
        self.bus.emit(
            names::SCREENING_RESULT_UPDATED,
            serde_json::json!({ "file_path": path, "status": "deleted" }),
        );
        Ok(())
    }

    /// Drop tags, chunks, and embeddings tied to a stale or deleted row.
    fn invalidate_derived(&self, row: &ScreeningResult) -> StoreResult<()> {
        self.store.detach_tags_for_file(row.id, None)?;
        let chunk_ids = self.store.delete_chunks_for_file(&row.file_path)?;
        if !chunk_ids.is_empty() {
            self.index.remove(&chunk_ids);
        }
        self.bus.emit(names::TAGS_UPDATED, serde_json::json!({ "file_path": row.file_path }));
        Ok(())
    }

    /// Prune every live row under a deleted folder. Driven by the
    /// `database-updated` notifications the config queue emits.
    pub fn prune_stale_paths(&self, paths: &[String]) -> StoreResult<usize> {
        let mut pruned = 0usize;
        for path in paths {
            if let Some(row) = self.store.get_screening(path)? {
                if row.status == ScreeningStatus::Stale {
                    self.store.set_screening_status(path, ScreeningStatus::Deleted)?;
                    self.invalidate_derived(&row)?;
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            self.bus.emit(
                names::SCREENING_RESULT_UPDATED,
                serde_json::json!({ "pruned": pruned }),
            );
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candidate(path: &str, size: u64) -> FileCandidate {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        FileCandidate {
            extension: name.rsplit_once('.').map(|(_, e)| e.to_lowercase()),
            path: path.to_string(),
            name,
            size,
            mtime: Utc.timestamp_opt(1_000, 0).unwrap(),
            is_bundle: false,
        }
    }

    #[test]
    fn mapping_priority_breaks_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let docs = store.upsert_category("document", None, None).unwrap();
        let data = store.upsert_category("data", None, None).unwrap();
        store.add_mapping("md", docs.id, MappingPriority::Medium).unwrap();
        store.add_mapping("md", data.id, MappingPriority::High).unwrap();

        let cache = RuleCache::build(&store).unwrap();
        assert_eq!(cache.category_for(Some("md")), Some(data.id));
    }

    #[test]
    fn mapping_tie_goes_to_most_recent_rule() {
        let store = Store::open_in_memory().unwrap();
        let a = store.upsert_category("a", None, None).unwrap();
        let b = store.upsert_category("b", None, None).unwrap();
        store.add_mapping("md", a.id, MappingPriority::Medium).unwrap();
        store.add_mapping("md", b.id, MappingPriority::Medium).unwrap();

        let cache = RuleCache::build(&store).unwrap();
        assert_eq!(cache.category_for(Some("md")), Some(b.id));
    }

    #[test]
    fn exclude_rule_short_circuits() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_rule(
                "no logs",
                RuleType::Extension,
                "log",
                PatternType::Exact,
                RuleAction::Exclude,
                100,
                false,
                None,
            )
            .unwrap();
        store
            .add_rule(
                "include everything",
                RuleType::Path,
                ".*",
                PatternType::Regex,
                RuleAction::Include,
                10,
                false,
                None,
            )
            .unwrap();

        let cache = RuleCache::build(&store).unwrap();
        assert_eq!(cache.decide(&candidate("/x/app.log", 10)), Decision::Exclude);
        assert!(matches!(
            cache.decide(&candidate("/x/app.txt", 10)),
            Decision::Include { .. }
        ));
    }

    #[test]
    fn higher_priority_rule_wins() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_rule(
                "keep md",
                RuleType::Extension,
                "md",
                PatternType::Exact,
                RuleAction::Include,
                200,
                false,
                None,
            )
            .unwrap();
        store
            .add_rule(
                "drop docs dir",
                RuleType::Path,
                "/docs/**",
                PatternType::Glob,
                RuleAction::Exclude,
                100,
                false,
                None,
            )
            .unwrap();

        let cache = RuleCache::build(&store).unwrap();
        // The include outranks the glob exclude for .md files in /docs.
        assert!(matches!(
            cache.decide(&candidate("/docs/readme.md", 10)),
            Decision::Include { .. }
        ));
        assert_eq!(cache.decide(&candidate("/docs/readme.pdf", 10)), Decision::Exclude);
    }

    #[test]
    fn size_rule_matches_above_threshold() {
        let store = Store::open_in_memory().unwrap();
        store
            .add_rule(
                "giant files",
                RuleType::Size,
                "1000",
                PatternType::Exact,
                RuleAction::Exclude,
                50,
                false,
                None,
            )
            .unwrap();

        let cache = RuleCache::build(&store).unwrap();
        assert_eq!(cache.decide(&candidate("/x/big.bin", 2_000)), Decision::Exclude);
        assert!(matches!(cache.decide(&candidate("/x/ok.bin", 500)), Decision::Include { .. }));
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let store = Store::open_in_memory().unwrap();
        let rule = store
            .add_rule(
                "no md",
                RuleType::Extension,
                "md",
                PatternType::Exact,
                RuleAction::Exclude,
                100,
                false,
                None,
            )
            .unwrap();
        store.update_rule(rule.id, None, None, None, Some(false)).unwrap();

        let cache = RuleCache::build(&store).unwrap();
        assert!(matches!(cache.decide(&candidate("/a.md", 1)), Decision::Include { .. }));
    }

    #[test]
    fn seeds_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        seed_defaults(&store).unwrap();
        seed_defaults(&store).unwrap();
        let cats = store.list_categories().unwrap();
        assert_eq!(cats.len(), 7);
        let cache = RuleCache::build(&store).unwrap();
        // Seeded hidden-file rule excludes dotfiles.
        assert_eq!(cache.decide(&candidate("/home/x/.env", 10)), Decision::Exclude);
    }

    #[test]
    fn content_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let h1 = content_hash_of(&path).unwrap();
        let h2 = content_hash_of(&path).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
