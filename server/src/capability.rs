//! Capability router — the single place abstract capabilities resolve to a
//! concrete provider + model.
//!
//! Providers are a tagged enum of wire protocols (OpenAI-like, Ollama-like);
//! there is no dynamic dispatch. `invoke` re-checks the assignment on every
//! call: the model must exist, be enabled, and advertise the capability, or
//! the caller gets `ModelMissing` and raises its user-visible event.
//!
//! Every outbound call carries a deadline. Reassignment bumps a generation
//! counter so in-flight pipeline work can detect that its binding went stale.

use mindex_core::config::{ProviderNetConfig, RetryPolicy};
use mindex_core::error::{ProviderError, StoreError};
use mindex_core::types::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::events::{names, EventBus};
use crate::store::Store;

/// Help link attached to capability-gap failure events.
pub const HELP_CAPABILITIES: &str = "https://github.com/leafmove/mindex/wiki/capabilities";

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CapabilityRequest {
    /// Embed a text chunk.
    EmbedText { text: String },
    /// Embed an image (base64) with optional caption context.
    EmbedImage { image_base64: String, caption: Option<String> },
    /// Produce `{ "tags": [...] }` for a bounded excerpt.
    StructuredTags { excerpt: String, max_tags: usize },
}

impl CapabilityRequest {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityRequest::EmbedText { .. } => Capability::Text,
            CapabilityRequest::EmbedImage { .. } => Capability::Vision,
            CapabilityRequest::StructuredTags { .. } => Capability::StructuredOutput,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CapabilityResponse {
    Embedding(Vec<f32>),
    Tags(Vec<String>),
}

impl CapabilityResponse {
    pub fn into_embedding(self) -> Result<Vec<f32>, ProviderError> {
        match self {
            CapabilityResponse::Embedding(v) => Ok(v),
            CapabilityResponse::Tags(_) => {
                Err(ProviderError::Malformed("expected embedding, got tags".into()))
            }
        }
    }

    pub fn into_tags(self) -> Result<Vec<String>, ProviderError> {
        match self {
            CapabilityResponse::Tags(t) => Ok(t),
            CapabilityResponse::Embedding(_) => {
                Err(ProviderError::Malformed("expected tags, got embedding".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct CapabilityRouter {
    store: Arc<Store>,
    bus: EventBus,
    retry: RetryPolicy,
    timeout: Duration,
    client: reqwest::blocking::Client,
    /// Client routed through the user-configured proxy, when one exists.
    proxy_client: Option<reqwest::blocking::Client>,
    generation: AtomicU64,
}

impl CapabilityRouter {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        net: &ProviderNetConfig,
        retry: RetryPolicy,
    ) -> Self {
        let timeout = Duration::from_secs(net.request_timeout_secs.max(1));
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let proxy_client = net.proxy_url.as_ref().and_then(|url| {
            match reqwest::Proxy::all(url) {
                Ok(proxy) => reqwest::blocking::Client::builder()
                    .timeout(timeout)
                    .proxy(proxy)
                    .build()
                    .ok(),
                Err(e) => {
                    warn!(error = %e, "Invalid proxy URL; proxied providers use direct client");
                    None
                }
            }
        });
        Self {
            store,
            bus,
            retry,
            timeout,
            client,
            proxy_client,
            generation: AtomicU64::new(0),
        }
    }

    /// Current binding generation. In-flight tasks snapshot this and fail
    /// with a retryable `capability_reassigned` when it moves.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bind a capability to a model (store-validated) and invalidate
    /// in-flight work.
    pub fn assign(&self, capability: Capability, model_id: i64) -> Result<(), StoreError> {
        self.store.assign_capability(capability, model_id)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bus.emit(
            names::MODEL_STATUS_CHANGED,
            json!({ "capability": capability.as_str(), "model_id": model_id }),
        );
        Ok(())
    }

    pub fn unassign(&self, capability: Capability) -> Result<(), StoreError> {
        self.store.clear_capability(capability)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bus.emit(
            names::MODEL_STATUS_CHANGED,
            json!({ "capability": capability.as_str(), "model_id": Value::Null }),
        );
        Ok(())
    }

    fn client_for(&self, provider: &ProviderConfig) -> &reqwest::blocking::Client {
        if provider.use_proxy {
            self.proxy_client.as_ref().unwrap_or(&self.client)
        } else {
            &self.client
        }
    }

    fn resolve(
        &self,
        capability: Capability,
    ) -> Result<(ModelConfig, ProviderConfig), ProviderError> {
        let assignment = self
            .store
            .resolve_capability(capability)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let Some((model, provider)) = assignment else {
            return Err(ProviderError::ModelMissing { capability: capability.as_str() });
        };
        if !model.is_enabled
            || !model.capabilities.advertises(capability)
            || !provider.is_active
        {
            return Err(ProviderError::ModelMissing { capability: capability.as_str() });
        }
        Ok((model, provider))
    }

    /// Invoke the capability once, without retries.
    pub fn invoke(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, ProviderError> {
        let capability = request.capability();
        let (model, provider) = self.resolve(capability)?;
        debug!(
            capability = capability.as_str(),
            model = model.model_identifier.as_str(),
            "Provider call"
        );
        self.dispatch(&provider, &model, request)
    }

    /// Invoke with the centralized retry policy; transient errors back off,
    /// permanent errors short-circuit.
    pub fn invoke_with_retry(
        &self,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, ProviderError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.invoke(request) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Wire protocols
    // -----------------------------------------------------------------------

    fn dispatch(
        &self,
        provider: &ProviderConfig,
        model: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, ProviderError> {
        match provider.kind {
            ProviderKind::OpenAiLike => self.call_openai_like(provider, model, request),
            ProviderKind::OllamaLike => self.call_ollama_like(provider, model, request),
        }
    }

    fn base_url(provider: &ProviderConfig) -> String {
        let default = match provider.kind {
            ProviderKind::OpenAiLike => "https://api.openai.com",
            ProviderKind::OllamaLike => "http://127.0.0.1:11434",
        };
        provider.base_url.as_deref().unwrap_or(default).trim_end_matches('/').to_string()
    }

    fn post(
        &self,
        provider: &ProviderConfig,
        url: &str,
        body: Value,
    ) -> Result<Value, ProviderError> {
        let mut req = self.client_for(provider).post(url).timeout(self.timeout).json(&body);
        if let Some(key) = &provider.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().map_err(classify_reqwest_error(self.timeout))?;
        read_json_response(response)
    }

    fn get(&self, provider: &ProviderConfig, url: &str) -> Result<Value, ProviderError> {
        let mut req = self.client_for(provider).get(url).timeout(self.timeout);
        if let Some(key) = &provider.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().map_err(classify_reqwest_error(self.timeout))?;
        read_json_response(response)
    }

    fn call_openai_like(
        &self,
        provider: &ProviderConfig,
        model: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, ProviderError> {
        let base = Self::base_url(provider);
        match request {
            CapabilityRequest::EmbedText { text } => {
                let body = json!({ "model": model.model_identifier, "input": [text] });
                let json = self.post(provider, &format!("{base}/v1/embeddings"), body)?;
                parse_openai_embedding(&json)
            }
            CapabilityRequest::EmbedImage { image_base64, caption } => {
                let input = json!([{ "image": image_base64, "text": caption }]);
                let body = json!({ "model": model.model_identifier, "input": input });
                let json = self.post(provider, &format!("{base}/v1/embeddings"), body)?;
                parse_openai_embedding(&json)
            }
            CapabilityRequest::StructuredTags { excerpt, max_tags } => {
                let body = json!({
                    "model": model.model_identifier,
                    "response_format": { "type": "json_object" },
                    "messages": [
                        { "role": "system", "content": tags_prompt(*max_tags) },
                        { "role": "user", "content": excerpt },
                    ],
                });
                let json = self.post(provider, &format!("{base}/v1/chat/completions"), body)?;
                let content = json["choices"][0]["message"]["content"]
                    .as_str()
                    .ok_or_else(|| ProviderError::Malformed("no message content".into()))?;
                parse_tags_json(content)
            }
        }
    }

    fn call_ollama_like(
        &self,
        provider: &ProviderConfig,
        model: &ModelConfig,
        request: &CapabilityRequest,
    ) -> Result<CapabilityResponse, ProviderError> {
        let base = Self::base_url(provider);
        match request {
            CapabilityRequest::EmbedText { text } => {
                let body = json!({ "model": model.model_identifier, "prompt": text });
                let json = self.post(provider, &format!("{base}/api/embeddings"), body)?;
                parse_ollama_embedding(&json)
            }
            CapabilityRequest::EmbedImage { image_base64, caption } => {
                let body = json!({
                    "model": model.model_identifier,
                    "prompt": caption.clone().unwrap_or_default(),
                    "images": [image_base64],
                });
                let json = self.post(provider, &format!("{base}/api/embeddings"), body)?;
                parse_ollama_embedding(&json)
            }
            CapabilityRequest::StructuredTags { excerpt, max_tags } => {
                let body = json!({
                    "model": model.model_identifier,
                    "prompt": format!("{}\n\n{excerpt}", tags_prompt(*max_tags)),
                    "format": "json",
                    "stream": false,
                });
                let json = self.post(provider, &format!("{base}/api/generate"), body)?;
                let content = json["response"]
                    .as_str()
                    .ok_or_else(|| ProviderError::Malformed("no response field".into()))?;
                parse_tags_json(content)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Discovery and validation
    // -----------------------------------------------------------------------

    /// List the provider's models and register unknown ones (disabled).
    pub fn discover(&self, provider_id: i64) -> Result<Vec<ModelConfig>, ProviderError> {
        let provider = self
            .store
            .get_provider(provider_id)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !provider.support_discovery {
            return Err(ProviderError::Malformed("provider does not support discovery".into()));
        }
        let base = Self::base_url(&provider);
        let identifiers: Vec<String> = match provider.kind {
            ProviderKind::OpenAiLike => {
                let json = self.get(&provider, &format!("{base}/v1/models"))?;
                json["data"]
                    .as_array()
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m["id"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            ProviderKind::OllamaLike => {
                let json = self.get(&provider, &format!("{base}/api/tags"))?;
                json["models"]
                    .as_array()
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m["name"].as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };

        let mut out = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            let model = self
                .store
                .upsert_model(provider.id, &id, &id, Capabilities::default(), false)
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            out.push(model);
        }
        info!(provider = provider.display_name.as_str(), models = out.len(), "Discovery done");
        Ok(out)
    }

    /// Probe a model with canned prompts for each capability and persist
    /// what it actually supports.
    pub fn confirm_capability(&self, model_id: i64) -> Result<Capabilities, ProviderError> {
        let model = self
            .store
            .get_model(model_id)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let provider = self
            .store
            .get_provider(model.provider_id)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let mut caps = Capabilities::default();
        let text_probe =
            CapabilityRequest::EmbedText { text: "capability probe".to_string() };
        caps.text = self.dispatch(&provider, &model, &text_probe).is_ok();

        let vision_probe = CapabilityRequest::EmbedImage {
            // 1x1 transparent PNG
            image_base64: "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk\
                           YPhfDwAChwGA60e6kgAAAABJRU5ErkJggg=="
                .to_string(),
            caption: Some("probe".to_string()),
        };
        caps.vision = self.dispatch(&provider, &model, &vision_probe).is_ok();

        let tags_probe = CapabilityRequest::StructuredTags {
            excerpt: "Quarterly budget review for the finance team.".to_string(),
            max_tags: 3,
        };
        caps.structured_output = self.dispatch(&provider, &model, &tags_probe).is_ok();
        // Tool use rides on the structured-output surface for both protocols.
        caps.tool_use = caps.structured_output;

        if caps == Capabilities::default() {
            self.bus.emit(
                names::MODEL_VALIDATION_FAILED,
                json!({
                    "model_id": model.id,
                    "model": model.model_identifier,
                    "help": HELP_CAPABILITIES,
                }),
            );
        } else {
            self.bus.emit(
                names::MODEL_STATUS_CHANGED,
                json!({ "model_id": model.id, "capabilities": caps }),
            );
        }

        self.store
            .set_model_capabilities(model.id, caps)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(caps)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn tags_prompt(max_tags: usize) -> String {
    format!(
        "Extract at most {max_tags} short noun-phrase tags describing the \
         document excerpt. Respond with JSON only: {{\"tags\": [\"...\"]}}"
    )
}

fn parse_tags_json(content: &str) -> Result<CapabilityResponse, ProviderError> {
    let value: Value = serde_json::from_str(content.trim())
        .map_err(|e| ProviderError::Malformed(format!("tags JSON: {e}")))?;
    let tags = value["tags"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("missing tags array".into()))?
        .iter()
        .filter_map(|t| t.as_str())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(CapabilityResponse::Tags(tags))
}

fn parse_openai_embedding(json: &Value) -> Result<CapabilityResponse, ProviderError> {
    let embedding = json["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("missing embedding".into()))?
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect::<Vec<f32>>();
    if embedding.is_empty() {
        return Err(ProviderError::Malformed("empty embedding".into()));
    }
    Ok(CapabilityResponse::Embedding(embedding))
}

fn parse_ollama_embedding(json: &Value) -> Result<CapabilityResponse, ProviderError> {
    let embedding = json["embedding"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("missing embedding".into()))?
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect::<Vec<f32>>();
    if embedding.is_empty() {
        return Err(ProviderError::Malformed("empty embedding".into()));
    }
    Ok(CapabilityResponse::Embedding(embedding))
}

fn classify_reqwest_error(timeout: Duration) -> impl Fn(reqwest::Error) -> ProviderError {
    move |e: reqwest::Error| {
        if e.is_timeout() {
            ProviderError::Timeout { seconds: timeout.as_secs() }
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

fn read_json_response(response: reqwest::blocking::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(ProviderError::RateLimited);
    }
    if !status.is_success() {
        let message = response.text().unwrap_or_default();
        let message = message.chars().take(300).collect();
        return Err(ProviderError::Http { status: status.as_u16(), message });
    }
    response.json().map_err(|e| ProviderError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use mindex_core::config::EventBusConfig;

    fn router() -> (CapabilityRouter, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::with_sink(EventBusConfig::default(), Box::new(MemorySink::new()));
        let router = CapabilityRouter::new(
            Arc::clone(&store),
            bus,
            &ProviderNetConfig::default(),
            RetryPolicy { max_attempts: 2, base_delay_ms: 1, factor: 2, task_deadline_secs: 5 },
        );
        (router, store)
    }

    fn seeded_model(store: &Store, enabled: bool) -> ModelConfig {
        let provider = store
            .add_provider(
                ProviderKind::OllamaLike,
                "local",
                Some("http://127.0.0.1:1"), // unroutable; calls must not be needed
                None,
                false,
                ProviderSource::Builtin,
                true,
            )
            .unwrap();
        store
            .upsert_model(
                provider.id,
                "nomic-embed-text",
                "Nomic",
                Capabilities { text: true, structured_output: true, ..Default::default() },
                enabled,
            )
            .unwrap()
    }

    #[test]
    fn missing_assignment_is_model_missing() {
        let (router, _store) = router();
        let err = router
            .invoke(&CapabilityRequest::EmbedText { text: "x".into() })
            .unwrap_err();
        assert!(matches!(err, ProviderError::ModelMissing { capability: "text" }));
    }

    #[test]
    fn disabled_model_is_model_missing() {
        let (router, store) = router();
        let model = seeded_model(&store, true);
        router.assign(Capability::Text, model.id).unwrap();
        store.set_model_enabled(model.id, false).unwrap();

        let err = router
            .invoke(&CapabilityRequest::EmbedText { text: "x".into() })
            .unwrap_err();
        assert!(matches!(err, ProviderError::ModelMissing { .. }));
    }

    #[test]
    fn reassignment_bumps_generation() {
        let (router, store) = router();
        let model = seeded_model(&store, true);
        let g0 = router.generation();
        router.assign(Capability::Text, model.id).unwrap();
        assert!(router.generation() > g0);
        let g1 = router.generation();
        router.unassign(Capability::Text).unwrap();
        assert!(router.generation() > g1);
    }

    #[test]
    fn assign_rejects_unadvertised_capability() {
        let (router, store) = router();
        let model = seeded_model(&store, true);
        let err = router.assign(Capability::Vision, model.id).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn tags_payload_parses() {
        let parsed = parse_tags_json(r#"{"tags": ["Budget Review", "finance", ""]}"#).unwrap();
        let tags = parsed.into_tags().unwrap();
        assert_eq!(tags, vec!["budget review".to_string(), "finance".to_string()]);
    }

    #[test]
    fn embedding_payloads_parse() {
        let openai = serde_json::json!({ "data": [ { "embedding": [0.1, 0.2] } ] });
        let v = parse_openai_embedding(&openai).unwrap().into_embedding().unwrap();
        assert_eq!(v.len(), 2);

        let ollama = serde_json::json!({ "embedding": [0.5, 0.5, 0.5] });
        let v = parse_ollama_embedding(&ollama).unwrap().into_embedding().unwrap();
        assert_eq!(v.len(), 3);
    }
}
