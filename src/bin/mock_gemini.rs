use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    /// Address to bind the mock Gemini server
    #[arg(long, default_value = "127.0.0.1:58089")]
    bind: SocketAddr,
}

#[derive(Clone, Serialize, Debug, Default)]
struct KeyStats {
    requests: u64,
    tokens: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
struct ForcedResponse {
    /// Non-2xx status returned with a Google-style error body.
    #[serde(default)]
    http_status: Option<u16>,
    /// Replaces the whole JSON envelope.
    #[serde(default)]
    body: Option<Value>,
    /// Replaces only the candidate text, keeping usage metadata.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    once: bool,
    #[serde(default)]
    delay_ms: Option<u64>,
}

#[derive(Default, Clone, Serialize)]
struct SnapshotState {
    keys: HashMap<String, KeyStats>,
    forced: Option<ForcedResponse>,
}

#[derive(Default)]
struct AppState {
    inner: RwLock<SnapshotState>,
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    let state = Arc::new(AppState::default());
    let app = Router::new()
        .route("/v1beta/models/:model_action", post(generate_content))
        .route(
            "/admin/force-response",
            post(set_forced_response).delete(clear_forced_response),
        )
        .route("/admin/state", get(read_state))
        .with_state(state);

    info!("mock Gemini listening on http://{}/v1beta", cli.bind);
    axum::serve(tokio::net::TcpListener::bind(cli.bind).await?, app).await?;
    Ok(())
}

async fn set_forced_response(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ForcedResponse>,
) -> (StatusCode, Json<Value>) {
    if payload.http_status.is_none() && payload.body.is_none() && payload.text.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "One of http_status, body, or text is required" })),
        );
    }
    let mut guard = state.inner.write().await;
    guard.forced = Some(payload);
    (StatusCode::OK, Json(json!({ "forced": guard.forced })))
}

async fn clear_forced_response(State(state): State<Arc<AppState>>) -> StatusCode {
    state.inner.write().await.forced = None;
    StatusCode::NO_CONTENT
}

async fn read_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    let guard = state.inner.read().await;
    Json(json!({ "keys": guard.keys, "forced": guard.forced }))
}

fn google_error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": status.canonical_reason().unwrap_or("UNKNOWN"),
            }
        })),
    )
}

async fn generate_content(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Query(query): Query<KeyQuery>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some((model, "generateContent")) = model_action.rsplit_once(':') else {
        return google_error(StatusCode::NOT_FOUND, "unsupported method");
    };
    let Some(key) = query.key.filter(|key| !key.is_empty()) else {
        return google_error(
            StatusCode::BAD_REQUEST,
            "API key not valid. Please pass a valid API key.",
        );
    };
    let prompt = body
        .pointer("/contents/0/parts/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let forced = {
        let mut guard = state.inner.write().await;
        let forced = guard.forced.clone();
        if guard.forced.as_ref().is_some_and(|force| force.once) {
            guard.forced = None;
        }
        forced
    };

    let mut text = None;
    if let Some(force) = forced {
        if let Some(delay) = force.delay_ms {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if let Some(status) = force.http_status {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return match force.body {
                Some(body) => (status, Json(body)),
                None => google_error(status, "forced failure"),
            };
        }
        if let Some(custom) = force.body {
            return (StatusCode::OK, Json(custom));
        }
        text = force.text;
    }

    let text = text.unwrap_or_else(|| canned_reply(prompt));
    let prompt_tokens = (prompt.len() / 4) as u64;
    let candidate_tokens = (text.len() / 4) as u64;
    let total_tokens = prompt_tokens + candidate_tokens;

    {
        let mut guard = state.inner.write().await;
        let stats = guard.keys.entry(key).or_default();
        stats.requests += 1;
        stats.tokens += total_tokens;
    }

    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {
                "promptTokenCount": prompt_tokens,
                "candidatesTokenCount": candidate_tokens,
                "totalTokenCount": total_tokens
            },
            "modelVersion": model
        })),
    )
}

/// Answers in the shape the prompt asks for, wrapped in chatty prose the way
/// real models often do.
fn canned_reply(prompt: &str) -> String {
    let payload = if prompt.contains("\"resultados\"") {
        let resultados: Vec<Value> = prompt
            .lines()
            .filter_map(|line| line.strip_prefix("ID: "))
            .map(|id| {
                json!({
                    "id": id.trim(),
                    "nota": 7,
                    "comentario": "Resposta parcialmente correta."
                })
            })
            .collect();
        json!({ "resultados": resultados })
    } else {
        let count = requested_count(prompt).unwrap_or(1);
        let questoes: Vec<Value> = (1..=count)
            .map(|n| {
                json!({
                    "texto": format!("Questão simulada {n}"),
                    "tipo": "objetiva",
                    "alternativas": [
                        { "texto": "Primeira opção", "correta": true },
                        { "texto": "Segunda opção", "correta": false },
                        { "texto": "Terceira opção", "correta": false },
                        { "texto": "Quarta opção", "correta": false }
                    ]
                })
            })
            .collect();
        json!({ "questoes": questoes })
    };
    format!("Claro! Segue o resultado:\n```json\n{payload:#}\n```\nBons estudos!")
}

fn requested_count(prompt: &str) -> Option<usize> {
    let rest = prompt.split("Crie exatamente ").nth(1)?;
    rest.split_whitespace().next()?.parse().ok()
}
