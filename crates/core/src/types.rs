//! Entity types persisted by the store plus the wire-level event envelope.
//!
//! Ids are SQLite rowids (`i64`) except sessions, which use UUID strings so
//! the host can mint them offline. Timestamps are UTC throughout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Monitored folders
// ---------------------------------------------------------------------------

/// A folder the scanner monitors. Whitelist folders are walked; blacklist
/// folders prune subtrees of their owning whitelist root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredFolder {
    pub id: i64,
    /// Canonical absolute path. Unique among all folders.
    pub path: String,
    pub alias: Option<String>,
    pub is_blacklist: bool,
    /// Owning whitelist folder for blacklist entries.
    pub parent_id: Option<i64>,
    /// Seeded common folder (Documents, Desktop, ...) — may be blacklisted
    /// without a whitelist ancestor.
    pub is_common_folder: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Categories and extension mappings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCategory {
    pub id: i64,
    /// Unique display name ("document", "image", ...).
    pub name: String,
    pub icon: Option<String>,
    pub description: Option<String>,
}

/// Conflict priority when several mappings claim an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingPriority {
    Low,
    Medium,
    High,
}

impl MappingPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingPriority::Low => "low",
            MappingPriority::Medium => "medium",
            MappingPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(MappingPriority::Low),
            "medium" => Some(MappingPriority::Medium),
            "high" => Some(MappingPriority::High),
            _ => None,
        }
    }
}

/// Maps a lowercase, dot-free extension to exactly one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMapping {
    pub id: i64,
    pub extension: String,
    pub category_id: i64,
    pub priority: MappingPriority,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Filter rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Extension,
    Filename,
    Path,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Regex,
    Glob,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Include,
    Exclude,
}

/// A screening filter rule. System rules are immutable in `pattern` and
/// `action`; only `enabled` may be toggled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub pattern: String,
    pub pattern_type: PatternType,
    pub action: RuleAction,
    /// Higher priority evaluates first.
    pub priority: i64,
    pub enabled: bool,
    pub is_system: bool,
    pub category_id: Option<i64>,
}

/// Directory-name suffix that marks a directory as a single opaque file
/// (macOS `.app` bundles and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleExtension {
    pub id: i64,
    pub extension: String,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Screening results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreeningStatus {
    New,
    Tagged,
    Vectorized,
    Stale,
    Deleted,
}

impl ScreeningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScreeningStatus::New => "new",
            ScreeningStatus::Tagged => "tagged",
            ScreeningStatus::Vectorized => "vectorized",
            ScreeningStatus::Stale => "stale",
            ScreeningStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ScreeningStatus::New),
            "tagged" => Some(ScreeningStatus::Tagged),
            "vectorized" => Some(ScreeningStatus::Vectorized),
            "stale" => Some(ScreeningStatus::Stale),
            "deleted" => Some(ScreeningStatus::Deleted),
            _ => None,
        }
    }
}

/// Coarse per-file screening record. `file_path` is canonical and unique
/// among non-deleted rows; `modified_time` is monotonic per path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: DateTime<Utc>,
    pub category_id: Option<i64>,
    /// sha256 hex, computed lazily on the first full read.
    pub content_hash: Option<String>,
    pub status: ScreeningStatus,
}

/// What an idempotent screening write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreeningOutcome {
    /// New row.
    Inserted,
    /// Existing row with a strictly newer `modified_time` — status reset to `new`.
    Refreshed,
    /// Fingerprint `(content_hash, modified_time)` unchanged — no-op, no event.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagKind {
    System,
    Llm,
}

impl TagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TagKind::System => "SYSTEM",
            TagKind::Llm => "LLM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYSTEM" => Some(TagKind::System),
            "LLM" => Some(TagKind::Llm),
            _ => None,
        }
    }
}

/// A tag with a derived usage weight (count of active FileTag rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub kind: TagKind,
    pub weight: i64,
}

// ---------------------------------------------------------------------------
// Vector chunks and tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkTier {
    Parent,
    Child,
}

/// Modality of a single chunk. Files aggregate to [`FileModality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
        }
    }
}

/// File-level modality, derived from the chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileModality {
    Text,
    Image,
    Mixed,
}

/// One tier of the hierarchical chunking scheme. Children carry embeddings
/// in the vector index (keyed by chunk id); parents supply context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorChunk {
    pub id: i64,
    pub file_path: String,
    pub tier: ChunkTier,
    /// Present iff `tier == Child`; refers to a parent in the same file.
    pub parent_id: Option<i64>,
    /// Position within `(file_path, tier)`. Unique per that pair.
    pub ordinal: i64,
    pub text: Option<String>,
    pub modality: Modality,
    /// Fixed-dim embedding. Persisted in the vector index, not the store.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub token_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Pipeline stage, reported through `multivector-progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Queued,
    Parsing,
    Chunking,
    Vectorizing,
    Completed,
    Failed,
}

impl TaskStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStage::Queued => "queued",
            TaskStage::Parsing => "parsing",
            TaskStage::Chunking => "chunking",
            TaskStage::Vectorizing => "vectorizing",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
        }
    }
}

/// Per-file vectorization task. At most one non-terminal task per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizationTask {
    pub id: i64,
    pub file_path: String,
    pub status: TaskStatus,
    pub stage: TaskStage,
    /// 0–100.
    pub progress: u8,
    pub parent_count: Option<i64>,
    pub child_count: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUID string.
    pub id: String,
    pub name: String,
    /// Active scenario ("co_reading") or none for a normal session.
    pub scenario_id: Option<String>,
    /// Scenario payload, e.g. `{"pdf_path": "..."}` while co-reading.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedFile {
    pub session_id: String,
    pub file_path: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToolSelection {
    pub session_id: String,
    pub tool_name: String,
}

// ---------------------------------------------------------------------------
// Providers, models, capabilities
// ---------------------------------------------------------------------------

/// Wire protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiLike,
    OllamaLike,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAiLike => "open_ai_like",
            ProviderKind::OllamaLike => "ollama_like",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open_ai_like" => Some(ProviderKind::OpenAiLike),
            "ollama_like" => Some(ProviderKind::OllamaLike),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSource {
    Builtin,
    Configurable,
    Vip,
}

impl ProviderSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderSource::Builtin => "builtin",
            ProviderSource::Configurable => "configurable",
            ProviderSource::Vip => "vip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(ProviderSource::Builtin),
            "configurable" => Some(ProviderSource::Configurable),
            "vip" => Some(ProviderSource::Vip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: i64,
    pub kind: ProviderKind,
    pub display_name: String,
    pub base_url: Option<String>,
    /// Secret. Leaves the store only inside an outbound provider request.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub api_key: Option<String>,
    pub use_proxy: bool,
    pub is_active: bool,
    pub source_type: ProviderSource,
    pub support_discovery: bool,
}

/// Abstract model feature whose concrete binding is centralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
    ToolUse,
    StructuredOutput,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Text,
        Capability::Vision,
        Capability::ToolUse,
        Capability::StructuredOutput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Vision => "vision",
            Capability::ToolUse => "tool_use",
            Capability::StructuredOutput => "structured_output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Capability::Text),
            "vision" => Some(Capability::Vision),
            "tool_use" => Some(Capability::ToolUse),
            "structured_output" => Some(Capability::StructuredOutput),
            _ => None,
        }
    }
}

/// Capability set a model advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub text: bool,
    pub vision: bool,
    pub tool_use: bool,
    pub structured_output: bool,
}

impl Capabilities {
    pub fn advertises(&self, cap: Capability) -> bool {
        match cap {
            Capability::Text => self.text,
            Capability::Vision => self.vision,
            Capability::ToolUse => self.tool_use,
            Capability::StructuredOutput => self.structured_output,
        }
    }

    pub fn set(&mut self, cap: Capability, value: bool) {
        match cap {
            Capability::Text => self.text = value,
            Capability::Vision => self.vision = value,
            Capability::ToolUse => self.tool_use = value,
            Capability::StructuredOutput => self.structured_output = value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: i64,
    pub provider_id: i64,
    pub model_identifier: String,
    pub display_name: String,
    pub capabilities: Capabilities,
    pub is_enabled: bool,
}

/// Global `capability → model` binding. Capability is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCapabilityAssignment {
    pub capability: Capability,
    pub model_id: i64,
}

// ---------------------------------------------------------------------------
// Config queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeKind {
    AddWhite,
    AddBlack,
    DeleteFolder,
    ToggleStatus,
}

impl ConfigChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigChangeKind::AddWhite => "add_white",
            ConfigChangeKind::AddBlack => "add_black",
            ConfigChangeKind::DeleteFolder => "delete_folder",
            ConfigChangeKind::ToggleStatus => "toggle_status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_white" => Some(ConfigChangeKind::AddWhite),
            "add_black" => Some(ConfigChangeKind::AddBlack),
            "delete_folder" => Some(ConfigChangeKind::DeleteFolder),
            "toggle_status" => Some(ConfigChangeKind::ToggleStatus),
            _ => None,
        }
    }
}

/// A deferred topology mutation, logged while the initial scan runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub id: i64,
    pub kind: ConfigChangeKind,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub failed: bool,
}

// ---------------------------------------------------------------------------
// Bridge events and scan candidates
// ---------------------------------------------------------------------------

/// Host-facing event envelope, serialized one-per-line on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub event: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: String,
}

impl BridgeEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            source: "engine".to_string(),
        }
    }
}

/// One file produced by the scanner, headed for screening.
#[derive(Debug, Clone, Serialize)]
pub struct FileCandidate {
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Bundle directory surfaced as a single opaque file.
    pub is_bundle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_str() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
    }

    #[test]
    fn capabilities_advertise_matches_set() {
        let mut caps = Capabilities::default();
        assert!(!caps.advertises(Capability::Vision));
        caps.set(Capability::Vision, true);
        assert!(caps.advertises(Capability::Vision));
        assert!(!caps.advertises(Capability::Text));
    }

    #[test]
    fn tag_kind_uses_screaming_case_on_the_wire() {
        let json = serde_json::to_string(&TagKind::Llm).unwrap();
        assert_eq!(json, "\"LLM\"");
    }

    #[test]
    fn provider_api_key_never_serializes() {
        let provider = ProviderConfig {
            id: 1,
            kind: ProviderKind::OpenAiLike,
            display_name: "test".into(),
            base_url: Some("http://localhost".into()),
            api_key: Some("sk-secret".into()),
            use_proxy: false,
            is_active: true,
            source_type: ProviderSource::Configurable,
            support_discovery: true,
        };
        let json = serde_json::to_string(&provider).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
