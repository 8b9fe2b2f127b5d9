/* ------------------------------------------------------------------ */
/* HTTP adapter: POST /generate                                       */
/* ------------------------------------------------------------------ */

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::thread;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::error::{LmError, Result};
use crate::inference::{InferenceEngine, StopReason};
use crate::sampling::SelectionPolicy;

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt:     String,
    max_tokens: Option<usize>,
    #[serde(default)]
    policy:     SelectionPolicy,
    seed:       Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text:              String,
    pub model:             String,
    pub prompt_tokens:     usize,
    pub completion_tokens: usize,
    pub stop:              StopReason,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub workers:    usize,
    pub model_name: String,
    /// When set, requests must carry `Authorization: Bearer <key>`.
    pub api_key:    Option<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self { workers: 4, model_name: "finlm".to_string(), api_key: None }
    }
}

fn json_response(body: String, code: u16) -> Response<Cursor<Vec<u8>>> {
    let resp = Response::from_string(body).with_status_code(StatusCode(code));
    match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(h) => resp.with_header(h),
        Err(()) => resp,
    }
}

fn error_body(msg: &str) -> String {
    serde_json::json!({ "error": msg }).to_string()
}

fn status_for(err: &LmError) -> u16 {
    match err {
        LmError::InvalidInput(_) | LmError::ContextOverflow { .. } | LmError::TokenOutOfRange { .. } => 400,
        _ => 500,
    }
}

fn time_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(42)
}

/// Handle a `/generate` body. Returns the status code and the JSON response.
pub fn handle_generate(engine: &InferenceEngine, model_name: &str, body: &str) -> (u16, String) {
    let req: GenerateRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => return (400, error_body(&e.to_string())),
    };
    let max_tokens = req.max_tokens.unwrap_or_else(|| engine.default_max_tokens());
    let seed = req.seed.unwrap_or_else(time_seed);
    info!("[serve] prompt={:?} max_tokens={} policy={:?}", req.prompt, max_tokens, req.policy);

    match engine.generate(&req.prompt, max_tokens, &req.policy, seed) {
        Ok(g) => {
            let resp = GenerateResponse {
                completion_tokens: g.tokens.len(),
                prompt_tokens:     g.prompt_tokens,
                text:              g.text,
                model:             model_name.to_string(),
                stop:              g.stop,
            };
            match serde_json::to_string(&resp) {
                Ok(json) => (200, json),
                Err(e) => (500, error_body(&e.to_string())),
            }
        }
        Err(e) => (status_for(&e), error_body(&e.to_string())),
    }
}

fn authorized(request: &Request, api_key: Option<&str>) -> bool {
    let Some(key) = api_key else { return true };
    let expected = format!("Bearer {key}");
    request
        .headers()
        .iter()
        .any(|h| h.field.equiv("Authorization") && h.value.as_str() == expected)
}

fn serve_one(mut request: Request, engine: &InferenceEngine, opts: &ServeOptions) {
    let (code, body) = if request.url() != "/generate" {
        (404, error_body("Not Found"))
    } else if *request.method() != Method::Post {
        (405, error_body("Method Not Allowed"))
    } else if !authorized(&request, opts.api_key.as_deref()) {
        (401, error_body("Unauthorized"))
    } else {
        let mut body = String::new();
        if request.as_reader().read_to_string(&mut body).is_err() {
            (400, error_body("Failed to read request body"))
        } else {
            handle_generate(engine, &opts.model_name, &body)
        }
    };
    if let Err(e) = request.respond(json_response(body, code)) {
        warn!("failed to send response: {e}");
    }
}

/// Bind `addr` and serve until the process exits. `opts.workers` threads
/// pull requests from the shared listener; each request gets its own cache.
pub fn run_server(addr: &str, engine: Arc<InferenceEngine>, opts: ServeOptions) -> Result<()> {
    let server = Server::http(addr).map_err(|e| LmError::Io(std::io::Error::other(format!("bind {addr}: {e}"))))?;
    let server = Arc::new(server);

    info!("Server listening on http://{addr}");
    info!("POST http://{addr}/generate with JSON body:");
    info!(r#"  {{"prompt": "Net income for", "max_tokens": 64, "policy": {{"type": "top_p", "p": 0.9, "temperature": 0.8}}}}"#);

    let opts = Arc::new(opts);
    let workers: Vec<_> = (0..opts.workers.max(1))
        .map(|i| {
            let server = Arc::clone(&server);
            let engine = Arc::clone(&engine);
            let opts = Arc::clone(&opts);
            thread::Builder::new().name(format!("serve-{i}")).spawn(move || loop {
                match server.recv() {
                    Ok(request) => serve_one(request, &engine, &opts),
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            })
        })
        .collect::<std::io::Result<_>>()?;

    for w in workers {
        if w.join().is_err() {
            warn!("server worker panicked");
        }
    }
    Ok(())
}
