//! Loopback HTTP surface.
//!
//! CRUD for every configuration entity, screening queries, session
//! management, vectorization triggers, retrieval, builtin-model
//! initialization, the tool-response relay, and the OAuth callback relay.
//! Every response wears the `{success, data?, message?}` envelope;
//! errors map onto an appropriate status plus a structured body.
//! Serialization happens at this boundary only — handlers receive
//! validated values and talk to the engine context directly.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use mindex_core::error::{EngineError, StoreError};
use mindex_core::types::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config_queue::MutationOutcome;
use crate::events::names;
use crate::retrieval::RetrievalRequest;
use crate::store::ScreeningQuery;
use crate::types::AppContext;
use crate::vectorize::Priority;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

// ---------------------------------------------------------------------------
// Envelope helpers
// ---------------------------------------------------------------------------

fn ok(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn fail(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "success": false, "message": message.into() })))
}

fn engine_error(e: EngineError) -> ApiError {
    match &e {
        EngineError::Store(StoreError::NotFound(_)) => {
            fail(StatusCode::NOT_FOUND, e.to_string())
        }
        EngineError::Store(StoreError::Conflict(_)) => fail(StatusCode::CONFLICT, e.to_string()),
        EngineError::Store(StoreError::InvalidInput(_)) => {
            fail(StatusCode::BAD_REQUEST, e.to_string())
        }
        EngineError::Store(StoreError::Busy { .. }) => {
            fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        EngineError::Store(StoreError::Fatal(_)) => {
            fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        EngineError::Provider(p) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "success": false, "message": p.to_string() })),
        ),
        EngineError::Rejected { reason, detail } => (
            StatusCode::CONFLICT,
            Json(json!({ "success": false, "message": detail, "code": reason })),
        ),
        EngineError::Task { code, detail } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": detail, "code": code })),
        ),
        EngineError::Io(_) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn store_error(e: StoreError) -> ApiError {
    engine_error(EngineError::Store(e))
}

fn mutation_json(outcome: &MutationOutcome) -> Value {
    match outcome {
        MutationOutcome::Queued(change) => json!({ "status": "queued", "change": change }),
        MutationOutcome::Executed(result) => json!({ "status": "executed", "result": result }),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn api_health(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
        "scan_complete": ctx.engine.queue.is_scan_complete(),
        "indexed_chunks": ctx.engine.index.len(),
    }))
}

// ---------------------------------------------------------------------------
// Folders (through the config queue)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FolderBody {
    path: String,
    alias: Option<String>,
    #[serde(default)]
    is_blacklist: bool,
}

pub async fn folders_list(State(ctx): State<AppContext>) -> ApiResult {
    let folders = ctx.engine.store.list_folders().map_err(store_error)?;
    Ok(ok(folders))
}

pub async fn folders_add(
    State(ctx): State<AppContext>,
    Json(body): Json<FolderBody>,
) -> ApiResult {
    let outcome = if body.is_blacklist {
        ctx.engine.queue.add_blacklist(&body.path, body.alias.as_deref())
    } else {
        ctx.engine.queue.add_whitelist(&body.path, body.alias.as_deref())
    }
    .map_err(engine_error)?;
    Ok(ok(mutation_json(&outcome)))
}

#[derive(Deserialize)]
pub struct FolderPathQuery {
    path: String,
}

pub async fn folders_delete(
    State(ctx): State<AppContext>,
    Query(q): Query<FolderPathQuery>,
) -> ApiResult {
    let outcome = ctx.engine.queue.delete_folder(&q.path).map_err(engine_error)?;
    Ok(ok(mutation_json(&outcome)))
}

pub async fn folders_toggle(
    State(ctx): State<AppContext>,
    Json(body): Json<FolderPathQuery>,
) -> ApiResult {
    let outcome = ctx.engine.queue.toggle_folder(&body.path).map_err(engine_error)?;
    Ok(ok(mutation_json(&outcome)))
}

// ---------------------------------------------------------------------------
// Categories and extension mappings
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CategoryBody {
    name: String,
    icon: Option<String>,
    description: Option<String>,
}

pub async fn categories_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_categories().map_err(store_error)?))
}

pub async fn categories_upsert(
    State(ctx): State<AppContext>,
    Json(body): Json<CategoryBody>,
) -> ApiResult {
    let category = ctx
        .engine
        .store
        .upsert_category(&body.name, body.icon.as_deref(), body.description.as_deref())
        .map_err(store_error)?;
    Ok(ok(category))
}

pub async fn categories_delete(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> ApiResult {
    ctx.engine.store.delete_category(id).map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(json!({ "deleted": id })))
}

#[derive(Deserialize)]
pub struct MappingBody {
    extension: String,
    category_id: i64,
    priority: Option<MappingPriority>,
}

pub async fn mappings_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_mappings().map_err(store_error)?))
}

pub async fn mappings_add(
    State(ctx): State<AppContext>,
    Json(body): Json<MappingBody>,
) -> ApiResult {
    let mapping = ctx
        .engine
        .store
        .add_mapping(
            &body.extension,
            body.category_id,
            body.priority.unwrap_or(MappingPriority::Medium),
        )
        .map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(mapping))
}

pub async fn mappings_delete(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    ctx.engine.store.delete_mapping(id).map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Filter rules
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RuleBody {
    name: String,
    rule_type: RuleType,
    pattern: String,
    pattern_type: PatternType,
    action: RuleAction,
    #[serde(default)]
    priority: i64,
    category_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct RuleUpdateBody {
    pattern: Option<String>,
    action: Option<RuleAction>,
    priority: Option<i64>,
    enabled: Option<bool>,
}

pub async fn rules_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_rules().map_err(store_error)?))
}

pub async fn rules_add(State(ctx): State<AppContext>, Json(body): Json<RuleBody>) -> ApiResult {
    let rule = ctx
        .engine
        .store
        .add_rule(
            &body.name,
            body.rule_type,
            &body.pattern,
            body.pattern_type,
            body.action,
            body.priority,
            false,
            body.category_id,
        )
        .map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(rule))
}

pub async fn rules_update(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Json(body): Json<RuleUpdateBody>,
) -> ApiResult {
    let rule = ctx
        .engine
        .store
        .update_rule(id, body.pattern.as_deref(), body.action, body.priority, body.enabled)
        .map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(rule))
}

pub async fn rules_delete(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    ctx.engine.store.delete_rule(id).map_err(store_error)?;
    ctx.engine.screening.refresh_cache().map_err(store_error)?;
    Ok(ok(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Bundle extensions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BundleBody {
    extension: String,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

pub async fn bundles_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_bundle_extensions().map_err(store_error)?))
}

pub async fn bundles_upsert(
    State(ctx): State<AppContext>,
    Json(body): Json<BundleBody>,
) -> ApiResult {
    let bundle = ctx
        .engine
        .store
        .upsert_bundle_extension(&body.extension, body.is_active)
        .map_err(store_error)?;
    ctx.engine.refresh_topology().map_err(engine_error)?;
    Ok(ok(bundle))
}

pub async fn bundles_delete(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    ctx.engine.store.delete_bundle_extension(id).map_err(store_error)?;
    ctx.engine.refresh_topology().map_err(engine_error)?;
    Ok(ok(json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Providers, models, capabilities
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ProviderBody {
    kind: ProviderKind,
    display_name: String,
    base_url: Option<String>,
    api_key: Option<String>,
    #[serde(default)]
    use_proxy: bool,
    #[serde(default)]
    support_discovery: bool,
}

#[derive(Deserialize)]
pub struct ProviderUpdateBody {
    base_url: Option<String>,
    api_key: Option<String>,
    use_proxy: Option<bool>,
    is_active: Option<bool>,
}

pub async fn providers_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_providers().map_err(store_error)?))
}

pub async fn providers_add(
    State(ctx): State<AppContext>,
    Json(body): Json<ProviderBody>,
) -> ApiResult {
    let provider = ctx
        .engine
        .store
        .add_provider(
            body.kind,
            &body.display_name,
            body.base_url.as_deref(),
            body.api_key.as_deref(),
            body.use_proxy,
            ProviderSource::Configurable,
            body.support_discovery,
        )
        .map_err(store_error)?;
    Ok(ok(provider))
}

pub async fn providers_update(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Json(body): Json<ProviderUpdateBody>,
) -> ApiResult {
    let provider = ctx
        .engine
        .store
        .update_provider(
            id,
            body.base_url.as_deref(),
            body.api_key.as_deref(),
            body.use_proxy,
            body.is_active,
        )
        .map_err(store_error)?;
    Ok(ok(provider))
}

pub async fn providers_delete(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    ctx.engine.store.delete_provider(id).map_err(store_error)?;
    Ok(ok(json!({ "deleted": id })))
}

/// Provider HTTP happens off the async runtime.
pub async fn providers_discover(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> ApiResult {
    let engine = ctx.engine.clone();
    let models = tokio::task::spawn_blocking(move || engine.router.discover(id))
        .await
        .map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| engine_error(EngineError::Provider(e)))?;
    Ok(ok(models))
}

#[derive(Deserialize)]
pub struct ModelBody {
    provider_id: i64,
    model_identifier: String,
    display_name: Option<String>,
    #[serde(default)]
    capabilities: Capabilities,
    #[serde(default)]
    is_enabled: bool,
}

#[derive(Deserialize)]
pub struct ModelUpdateBody {
    is_enabled: Option<bool>,
    capabilities: Option<Capabilities>,
}

#[derive(Deserialize)]
pub struct ModelsQuery {
    provider_id: Option<i64>,
}

pub async fn models_list(
    State(ctx): State<AppContext>,
    Query(q): Query<ModelsQuery>,
) -> ApiResult {
    Ok(ok(ctx.engine.store.list_models(q.provider_id).map_err(store_error)?))
}

pub async fn models_add(State(ctx): State<AppContext>, Json(body): Json<ModelBody>) -> ApiResult {
    let model = ctx
        .engine
        .store
        .upsert_model(
            body.provider_id,
            &body.model_identifier,
            body.display_name.as_deref().unwrap_or(&body.model_identifier),
            body.capabilities,
            body.is_enabled,
        )
        .map_err(store_error)?;
    Ok(ok(model))
}

pub async fn models_update(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Json(body): Json<ModelUpdateBody>,
) -> ApiResult {
    let mut model = ctx.engine.store.get_model(id).map_err(store_error)?;
    if let Some(capabilities) = body.capabilities {
        model = ctx.engine.store.set_model_capabilities(id, capabilities).map_err(store_error)?;
    }
    if let Some(enabled) = body.is_enabled {
        model = ctx.engine.store.set_model_enabled(id, enabled).map_err(store_error)?;
        ctx.engine.bus.emit(
            names::MODEL_STATUS_CHANGED,
            json!({ "model_id": id, "is_enabled": enabled }),
        );
    }
    Ok(ok(model))
}

pub async fn models_delete(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    ctx.engine.store.delete_model(id).map_err(store_error)?;
    Ok(ok(json!({ "deleted": id })))
}

pub async fn models_confirm(State(ctx): State<AppContext>, Path(id): Path<i64>) -> ApiResult {
    let engine = ctx.engine.clone();
    let capabilities = tokio::task::spawn_blocking(move || engine.router.confirm_capability(id))
        .await
        .map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| engine_error(EngineError::Provider(e)))?;
    Ok(ok(capabilities))
}

#[derive(Deserialize)]
pub struct CapabilityBody {
    capability: Capability,
    model_id: i64,
}

pub async fn capabilities_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.store.list_assignments().map_err(store_error)?))
}

pub async fn capabilities_assign(
    State(ctx): State<AppContext>,
    Json(body): Json<CapabilityBody>,
) -> ApiResult {
    ctx.engine.router.assign(body.capability, body.model_id).map_err(store_error)?;
    Ok(ok(json!({ "capability": body.capability.as_str(), "model_id": body.model_id })))
}

pub async fn capabilities_clear(
    State(ctx): State<AppContext>,
    Path(capability): Path<String>,
) -> ApiResult {
    let capability = Capability::parse(&capability)
        .ok_or_else(|| fail(StatusCode::BAD_REQUEST, format!("unknown capability {capability}")))?;
    ctx.engine.router.unassign(capability).map_err(store_error)?;
    Ok(ok(json!({ "capability": capability.as_str() })))
}

// ---------------------------------------------------------------------------
// Screening queries
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ScreeningParams {
    category_id: Option<i64>,
    /// RFC 3339 timestamps.
    modified_after: Option<String>,
    modified_before: Option<String>,
    path: Option<String>,
    /// Comma-separated tag names.
    tags: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

pub async fn screening_query(
    State(ctx): State<AppContext>,
    Query(p): Query<ScreeningParams>,
) -> ApiResult {
    let parse_time = |s: &Option<String>| -> Result<Option<DateTime<Utc>>, ApiError> {
        match s {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| fail(StatusCode::BAD_REQUEST, format!("bad timestamp: {e}"))),
        }
    };

    let status = match &p.status {
        None => None,
        Some(raw) => Some(
            ScreeningStatus::parse(raw)
                .ok_or_else(|| fail(StatusCode::BAD_REQUEST, format!("bad status {raw}")))?,
        ),
    };

    let query = ScreeningQuery {
        category_id: p.category_id,
        modified_after: parse_time(&p.modified_after)?,
        modified_before: parse_time(&p.modified_before)?,
        path_substring: p.path.clone(),
        tag_names: p
            .tags
            .as_deref()
            .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default(),
        status,
        limit: p.limit.unwrap_or(200).min(1_000),
    };
    Ok(ok(ctx.engine.store.query_screening(&query).map_err(store_error)?))
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TagCloudQuery {
    limit: Option<usize>,
}

pub async fn tags_list(
    State(ctx): State<AppContext>,
    Query(q): Query<TagCloudQuery>,
) -> ApiResult {
    Ok(ok(ctx.engine.store.tag_cloud(q.limit.unwrap_or(100)).map_err(store_error)?))
}

pub async fn tags_cloud(State(ctx): State<AppContext>) -> ApiResult {
    let cached = ctx.engine.tags.cloud();
    if cached.is_empty() {
        return Ok(ok(ctx.engine.tags.refresh_cloud().map_err(engine_error)?));
    }
    Ok(ok(cached))
}

// ---------------------------------------------------------------------------
// Sessions and co-reading
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SessionBody {
    name: String,
}

pub async fn sessions_list(State(ctx): State<AppContext>) -> ApiResult {
    Ok(ok(ctx.engine.sessions.list().map_err(engine_error)?))
}

pub async fn sessions_create(
    State(ctx): State<AppContext>,
    Json(body): Json<SessionBody>,
) -> ApiResult {
    Ok(ok(ctx.engine.sessions.create(&body.name).map_err(engine_error)?))
}

pub async fn sessions_get(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(ctx.engine.sessions.get(&id).map_err(engine_error)?))
}

pub async fn sessions_rename(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<SessionBody>,
) -> ApiResult {
    Ok(ok(ctx.engine.sessions.rename(&id, &body.name).map_err(engine_error)?))
}

pub async fn sessions_delete(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    ctx.engine.sessions.delete(&id).map_err(engine_error)?;
    Ok(ok(json!({ "deleted": id })))
}

#[derive(Deserialize)]
pub struct PinBody {
    file_path: String,
    #[serde(default)]
    metadata: Value,
}

pub async fn sessions_pin(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<PinBody>,
) -> ApiResult {
    ctx.engine.sessions.pin(&id, &body.file_path, body.metadata).map_err(engine_error)?;
    Ok(ok(json!({ "pinned": body.file_path })))
}

#[derive(Deserialize)]
pub struct UnpinQuery {
    file_path: String,
}

pub async fn sessions_unpin(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(q): Query<UnpinQuery>,
) -> ApiResult {
    ctx.engine.sessions.unpin(&id, &q.file_path).map_err(engine_error)?;
    Ok(ok(json!({ "unpinned": q.file_path })))
}

pub async fn sessions_pins(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(ctx.engine.sessions.pinned(&id).map_err(engine_error)?))
}

#[derive(Deserialize)]
pub struct ToolsBody {
    tools: Vec<String>,
}

pub async fn sessions_set_tools(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<ToolsBody>,
) -> ApiResult {
    ctx.engine.sessions.set_tools(&id, &body.tools).map_err(engine_error)?;
    Ok(ok(json!({ "tools": body.tools })))
}

pub async fn sessions_tools(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(ctx.engine.sessions.tools(&id).map_err(engine_error)?))
}

#[derive(Deserialize)]
pub struct CoReadingBody {
    pdf_path: String,
}

pub async fn coreading_enter(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(body): Json<CoReadingBody>,
) -> ApiResult {
    Ok(ok(ctx.engine.sessions.enter_co_reading(&id, &body.pdf_path).map_err(engine_error)?))
}

pub async fn coreading_exit(State(ctx): State<AppContext>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(ctx.engine.sessions.exit_co_reading(&id).map_err(engine_error)?))
}

// ---------------------------------------------------------------------------
// Vectorization
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct VectorizeBody {
    file_path: String,
    /// Session-driven requests jump the queue.
    session_id: Option<String>,
}

pub async fn vectorize_trigger(
    State(ctx): State<AppContext>,
    Json(body): Json<VectorizeBody>,
) -> ApiResult {
    let priority =
        if body.session_id.is_some() { Priority::Interactive } else { Priority::Batch };
    let task =
        ctx.engine.vectorize.enqueue(&body.file_path, priority).map_err(engine_error)?;
    Ok(ok(task))
}

#[derive(Deserialize)]
pub struct VectorizeStatusQuery {
    file_path: String,
}

pub async fn vectorize_status(
    State(ctx): State<AppContext>,
    Query(q): Query<VectorizeStatusQuery>,
) -> ApiResult {
    let task = ctx.engine.store.task_for_file(&q.file_path).map_err(store_error)?;
    Ok(ok(task))
}

pub async fn vectorize_cancel(
    State(ctx): State<AppContext>,
    Json(body): Json<VectorizeStatusQuery>,
) -> ApiResult {
    ctx.engine.vectorize.cancel(&body.file_path);
    Ok(ok(json!({ "cancelling": body.file_path })))
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RetrieveBody {
    query: String,
    top_k: Option<usize>,
    modality: Option<Modality>,
    session_id: Option<String>,
    file_paths: Option<Vec<String>>,
}

pub async fn retrieve(State(ctx): State<AppContext>, Json(body): Json<RetrieveBody>) -> ApiResult {
    let engine = ctx.engine.clone();
    let query = body.query.clone();

    // Session scope restricts candidates to pinned files.
    let file_paths = match (&body.session_id, body.file_paths) {
        (Some(session_id), _) => {
            Some(engine.sessions.pinned_paths(session_id).map_err(engine_error)?)
        }
        (None, paths) => paths,
    };

    engine
        .bus
        .emit(names::RAG_PROGRESS, json!({ "stage": "retrieving", "query": query.clone() }));
    let request = RetrievalRequest {
        query: body.query,
        top_k: body.top_k,
        modality: body.modality,
        file_paths,
    };

    let engine_bg = engine.clone();
    let result = tokio::task::spawn_blocking(move || engine_bg.retrieval.retrieve(&request))
        .await
        .map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match result {
        Ok(hits) => {
            engine.bus.emit(
                names::RAG_RETRIEVAL_RESULT,
                json!({ "query": query, "hits": hits.len() }),
            );
            Ok(ok(hits))
        }
        Err(e) => {
            engine.bus.emit(names::RAG_ERROR, json!({ "query": query, "error": e.to_string() }));
            Err(engine_error(e))
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin models, audit, tool relay, OAuth
// ---------------------------------------------------------------------------

pub async fn builtin_init(State(ctx): State<AppContext>) -> ApiResult {
    let engine = ctx.engine.clone();
    let summary = tokio::task::spawn_blocking(move || engine.downloader.initialize_builtin())
        .await
        .map_err(|e| fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(engine_error)?;
    Ok(ok(summary))
}

/// Orphan audit: chunks without a live screening row are dropped from the
/// store and the index.
pub async fn audit_orphans(State(ctx): State<AppContext>) -> ApiResult {
    let orphans = ctx.engine.store.audit_orphan_chunks().map_err(store_error)?;
    let mut removed_chunks = 0usize;
    for path in &orphans {
        let ids = ctx.engine.store.delete_chunks_for_file(path).map_err(store_error)?;
        removed_chunks += ids.len();
        ctx.engine.index.remove(&ids);
    }
    ctx.engine.store.recount_tag_weights().map_err(store_error)?;
    Ok(ok(json!({ "orphan_files": orphans, "removed_chunks": removed_chunks })))
}

#[derive(Deserialize)]
pub struct ToolResponseBody {
    call_id: String,
    result: Option<Value>,
    error: Option<String>,
}

pub async fn tools_response(
    State(ctx): State<AppContext>,
    Json(body): Json<ToolResponseBody>,
) -> ApiResult {
    let outcome = match (body.result, body.error) {
        (_, Some(error)) => Err(error),
        (Some(result), None) => Ok(result),
        (None, None) => {
            return Err(fail(StatusCode::BAD_REQUEST, "result or error required"))
        }
    };
    ctx.engine.sessions.respond_tool_call(&body.call_id, outcome).map_err(engine_error)?;
    Ok(ok(json!({ "call_id": body.call_id })))
}

#[derive(Deserialize)]
pub struct OAuthQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// OAuth relay: the provider redirects the browser here; the engine only
/// forwards the outcome to the host and tells the user to close the tab.
pub async fn oauth_callback(
    State(ctx): State<AppContext>,
    Query(q): Query<OAuthQuery>,
) -> impl IntoResponse {
    match (&q.code, &q.error) {
        (Some(code), None) => {
            ctx.engine.bus.emit(
                names::OAUTH_CALLBACK_SUCCESS,
                json!({ "code": code, "state": q.state }),
            );
            Html("<html><body>Sign-in complete. You can close this window.</body></html>")
        }
        _ => {
            let error = q.error.clone().unwrap_or_else(|| "missing code".to_string());
            ctx.engine
                .bus
                .emit(names::OAUTH_CALLBACK_ERROR, json!({ "error": error, "state": q.state }));
            warn!(error = error.as_str(), "OAuth callback failed");
            Html("<html><body>Sign-in failed. You can close this window.</body></html>")
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/api/folders", get(folders_list).post(folders_add).delete(folders_delete))
        .route("/api/folders/toggle", post(folders_toggle))
        .route("/api/categories", get(categories_list).post(categories_upsert))
        .route("/api/categories/{id}", delete(categories_delete))
        .route("/api/mappings", get(mappings_list).post(mappings_add))
        .route("/api/mappings/{id}", delete(mappings_delete))
        .route("/api/rules", get(rules_list).post(rules_add))
        .route("/api/rules/{id}", put(rules_update).delete(rules_delete))
        .route("/api/bundles", get(bundles_list).post(bundles_upsert))
        .route("/api/bundles/{id}", delete(bundles_delete))
        .route("/api/providers", get(providers_list).post(providers_add))
        .route("/api/providers/{id}", put(providers_update).delete(providers_delete))
        .route("/api/providers/{id}/discover", post(providers_discover))
        .route("/api/models", get(models_list).post(models_add))
        .route("/api/models/{id}", put(models_update).delete(models_delete))
        .route("/api/models/{id}/confirm", post(models_confirm))
        .route("/api/models/builtin/init", post(builtin_init))
        .route("/api/capabilities", get(capabilities_list).put(capabilities_assign))
        .route("/api/capabilities/{capability}", delete(capabilities_clear))
        .route("/api/screening", get(screening_query))
        .route("/api/tags", get(tags_list))
        .route("/api/tags/cloud", get(tags_cloud))
        .route("/api/sessions", get(sessions_list).post(sessions_create))
        .route(
            "/api/sessions/{id}",
            get(sessions_get).put(sessions_rename).delete(sessions_delete),
        )
        .route("/api/sessions/{id}/pin", post(sessions_pin).delete(sessions_unpin))
        .route("/api/sessions/{id}/pins", get(sessions_pins))
        .route("/api/sessions/{id}/tools", get(sessions_tools).put(sessions_set_tools))
        .route("/api/sessions/{id}/coreading/enter", post(coreading_enter))
        .route("/api/sessions/{id}/coreading/exit", post(coreading_exit))
        .route("/api/vectorize", post(vectorize_trigger))
        .route("/api/vectorize/status", get(vectorize_status))
        .route("/api/vectorize/cancel", post(vectorize_cancel))
        .route("/api/retrieve", post(retrieve))
        .route("/api/audit", post(audit_orphans))
        .route("/api/tools/response", post(tools_response))
        .route("/oauth/callback", get(oauth_callback))
        .with_state(ctx)
}
