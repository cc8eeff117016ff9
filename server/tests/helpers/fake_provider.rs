//! Minimal canned HTTP provider speaking just enough of the Ollama wire
//! protocol for tests: embeddings are deterministic functions of the input
//! text, generation always returns a fixed tag set, discovery lists one
//! model. No external dependencies, one thread per connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const EMBED_DIM: usize = 8;

pub struct FakeProvider {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake provider");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_bg = Arc::clone(&hits);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let hits = Arc::clone(&hits_bg);
                std::thread::spawn(move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                    let _ = handle(stream);
                });
            }
        });

        FakeProvider { base_url: format!("http://{addr}"), hits }
    }

    pub fn request_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Deterministic toy embedding: same text, same vector; different text,
/// (almost certainly) different direction.
pub fn embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.1f32; EMBED_DIM];
    for (i, b) in text.bytes().enumerate() {
        v[i % EMBED_DIM] += f32::from(b) / 255.0 * ((i % 7) as f32 + 1.0);
    }
    v
}

fn handle(mut stream: TcpStream) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    // Read headers.
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_subslice(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
        if raw.len() > 1 << 20 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Read body.
    while raw.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let body = String::from_utf8_lossy(&raw[header_end..]).to_string();

    let response_json = route(&path, &body);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response_json.len(),
        response_json
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn route(path: &str, body: &str) -> String {
    if path.contains("/api/embeddings") {
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
        let prompt = parsed["prompt"].as_str().unwrap_or(body);
        let vector = embed(prompt);
        serde_json::json!({ "embedding": vector }).to_string()
    } else if path.contains("/api/generate") {
        serde_json::json!({ "response": "{\"tags\": [\"alpha\", \"review\"]}" }).to_string()
    } else if path.contains("/api/tags") {
        serde_json::json!({ "models": [ { "name": "fake-model" } ] }).to_string()
    } else {
        serde_json::json!({ "error": "unknown path" }).to_string()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
