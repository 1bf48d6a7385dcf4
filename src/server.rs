use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use exam_quota::{
    EssayItem, ExamAi, ExamAiError, GradeResult, KeyRoster, KeyUsage, Question, QuestionRequest,
    QuotaDocument, key_fingerprint, now_millis,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub struct AppState {
    pub ai: ExamAi,
    pub roster: KeyRoster,
    pub forward_auth: ForwardAuthConfig,
}

/// 通过反向代理注入的用户头判断管理员身份。
#[derive(Clone, Debug, Default)]
pub struct ForwardAuthConfig {
    user_header: Option<HeaderName>,
    admin_value: Option<String>,
    nickname_header: Option<HeaderName>,
    admin_override_name: Option<String>,
}

impl ForwardAuthConfig {
    pub fn new(
        user_header: Option<HeaderName>,
        admin_value: Option<String>,
        nickname_header: Option<HeaderName>,
        admin_override_name: Option<String>,
    ) -> Self {
        Self {
            user_header,
            admin_value,
            nickname_header,
            admin_override_name,
        }
    }

    fn is_enabled(&self) -> bool {
        self.user_header.is_some() || self.admin_override_name.is_some()
    }

    fn user_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        header_value(self.user_header.as_ref(), headers)
    }

    fn nickname_value(&self, headers: &HeaderMap) -> Option<String> {
        header_value(self.nickname_header.as_ref(), headers).map(str::to_owned)
    }

    fn is_request_admin(&self, headers: &HeaderMap) -> bool {
        if self.admin_override_name.is_some() {
            return true;
        }
        if !self.is_enabled() {
            return false;
        }
        match (self.admin_value.as_deref(), self.user_value(headers)) {
            (Some(expected), Some(actual)) => actual == expected,
            _ => false,
        }
    }
}

fn header_value<'a>(name: Option<&HeaderName>, headers: &'a HeaderMap) -> Option<&'a str> {
    name.and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Serialize)]
struct ErrorView {
    error: String,
}

/// Error half of every handler: a status plus `{"error": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "admin access required".to_owned(),
        }
    }
}

impl From<ExamAiError> for ApiError {
    fn from(err: ExamAiError) -> Self {
        let status = match &err {
            ExamAiError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            ExamAiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ExamAiError::RequestFailed { .. } | ExamAiError::MalformedAiResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            ExamAiError::InvalidEndpoint { .. }
            | ExamAiError::Database(_)
            | ExamAiError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && !err.is_upstream() {
            error!(error = %err, "request failed");
        } else {
            warn!(%status, error = %err, "request rejected");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorView {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.forward_auth.is_request_admin(headers) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

/// Callers may only steer selection toward keys an admin registered.
/// Anything else would add the caller's own key to the shared roster and the
/// server-wide last-key cache.
async fn registered_preferred_key(
    state: &AppState,
    preferred: Option<&str>,
) -> Result<Option<String>, ApiError> {
    let Some(key) = preferred.map(str::trim).filter(|key| !key.is_empty()) else {
        return Ok(None);
    };
    if !state.roster.is_registered(key).await? {
        return Err(ExamAiError::InvalidRequest(
            "preferredKey is not a registered API key".to_owned(),
        )
        .into());
    }
    Ok(Some(key.to_owned()))
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    display_name: Option<String>,
    is_admin: bool,
}

async fn get_profile(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<ProfileView> {
    let config = &state.forward_auth;

    if let Some(name) = config.admin_override_name.as_deref() {
        return Json(ProfileView {
            display_name: Some(name.to_owned()),
            is_admin: true,
        });
    }

    let display_name = config
        .nickname_value(&headers)
        .or_else(|| config.user_value(&headers).map(str::to_owned));
    Json(ProfileView {
        is_admin: display_name.is_some() && config.is_request_admin(&headers),
        display_name,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionsPayload {
    #[serde(flatten)]
    request: QuestionRequest,
    #[serde(default)]
    preferred_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct QuestionsView {
    questoes: Vec<Question>,
}

async fn generate_questions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuestionsPayload>,
) -> Result<Json<QuestionsView>, ApiError> {
    let preferred = registered_preferred_key(&state, payload.preferred_key.as_deref()).await?;
    let questoes = state
        .ai
        .generate_questions(&payload.request, preferred.as_deref())
        .await?;
    Ok(Json(QuestionsView { questoes }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GradingPayload {
    items: Vec<EssayItem>,
    #[serde(default)]
    preferred_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct GradingView {
    resultados: Vec<GradeResult>,
}

async fn grade_answers(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GradingPayload>,
) -> Result<Json<GradingView>, ApiError> {
    let preferred = registered_preferred_key(&state, payload.preferred_key.as_deref()).await?;
    let resultados = state
        .ai
        .grade_essay_answers(&payload.items, preferred.as_deref())
        .await?;
    Ok(Json(GradingView { resultados }))
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeyUsage>>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.roster.usage_report(now_millis()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyRequest {
    #[serde(alias = "api_key")]
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CreateKeyResponse {
    fingerprint: String,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), ApiError> {
    require_admin(&state, &headers)?;
    state.roster.register(&payload.api_key).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            fingerprint: key_fingerprint(payload.api_key.trim()),
        }),
    ))
}

async fn export_quota_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<QuotaDocument>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.roster.export_document().await?))
}

#[derive(Debug, Serialize)]
struct ImportView {
    imported: usize,
}

async fn import_quota_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(document): Json<QuotaDocument>,
) -> Result<Json<ImportView>, ApiError> {
    require_admin(&state, &headers)?;
    let imported = state.roster.import_document(&document).await?;
    Ok(Json(ImportView { imported }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/profile", get(get_profile))
        .route("/api/questions", post(generate_questions))
        .route("/api/grading", post(grade_answers))
        // Key roster (admin only)
        .route("/api/keys", get(list_keys).post(create_api_key))
        .route(
            "/api/quota-document",
            get(export_quota_document).put(import_quota_document),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!(
        model = state.ai.model(),
        "exam AI server listening on http://{bound_addr}"
    );

    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    info!("exam AI server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use exam_quota::{
        GeminiTransport, KeyCache, KeyLimiter, LAST_KEY_SLOT, MemoryKeyCache, MemoryQuotaStore,
        QuotaLimits, QuotaRecord, QuotaStore, WriteMode,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const ADMIN_HEADER: &str = "x-forwarded-user";

    fn state_with(store: Arc<MemoryQuotaStore>, forward_auth: ForwardAuthConfig) -> Arc<AppState> {
        state_with_cache(store, Arc::new(MemoryKeyCache::new()), forward_auth)
    }

    fn state_with_cache(
        store: Arc<MemoryQuotaStore>,
        cache: Arc<MemoryKeyCache>,
        forward_auth: ForwardAuthConfig,
    ) -> Arc<AppState> {
        // Port 9 (discard) refuses connections, so any upstream call fails fast.
        let transport = GeminiTransport::new("http://127.0.0.1:9/v1beta", "test-model").unwrap();
        let ai = ExamAi::new(transport, store.clone(), cache, QuotaLimits::default());
        let roster = KeyRoster::new(store, KeyLimiter::new(QuotaLimits::default()));
        Arc::new(AppState {
            ai,
            roster,
            forward_auth,
        })
    }

    fn admin_auth() -> ForwardAuthConfig {
        ForwardAuthConfig::new(
            Some(HeaderName::from_static(ADMIN_HEADER)),
            Some("admin".to_owned()),
            None,
            None,
        )
    }

    async fn send(
        state: Arc<AppState>,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(ADMIN_HEADER, user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn question_body(count: u8) -> Value {
        json!({
            "subject": "Geografia",
            "topic": "Relevo",
            "difficulty": "facil",
            "count": count,
            "questionType": "objetiva"
        })
    }

    #[tokio::test]
    async fn health_is_ok() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_keys_maps_to_too_many_requests() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let body = Some(question_body(3));
        let (status, body) = send(state, "POST", "/api/questions", None, body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["error"].as_str().unwrap().contains("budget"));
    }

    #[tokio::test]
    async fn invalid_count_maps_to_bad_request() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let body = Some(question_body(0));
        let (status, body) = send(state, "POST", "/api/questions", None, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    fn grading_body(preferred_key: Option<&str>) -> Value {
        json!({
            "items": [{
                "id": "q1",
                "prompt": "Defina relevo",
                "referenceAnswer": "Formas da superfície",
                "studentAnswer": "Montanhas"
            }],
            "preferredKey": preferred_key
        })
    }

    async fn registered(keys: &[&str]) -> Arc<MemoryQuotaStore> {
        let store = Arc::new(MemoryQuotaStore::new());
        for key in keys {
            store
                .write(key, &QuotaRecord::default(), WriteMode::CreateOnly)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn unreachable_provider_maps_to_bad_gateway_without_charge() {
        let store = registered(&["AIzaUnreachable"]).await;
        let state = state_with(store.clone(), admin_auth());
        let body = Some(grading_body(Some("AIzaUnreachable")));
        let (status, body) = send(state, "POST", "/api/grading", None, body).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().starts_with("AI request failed"));
        assert_eq!(
            store.read().await.unwrap()["AIzaUnreachable"],
            QuotaRecord::default()
        );
    }

    #[tokio::test]
    async fn caller_supplied_key_must_already_be_registered() {
        let store = registered(&["admin-key"]).await;
        let cache = Arc::new(MemoryKeyCache::new());
        let state = state_with_cache(store.clone(), cache.clone(), admin_auth());

        let mut request = question_body(2);
        request["preferredKey"] = json!("user-a-private-key");
        let (status, body) =
            send(state.clone(), "POST", "/api/questions", None, Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not a registered"));

        let body = Some(grading_body(Some("user-a-private-key")));
        let (status, _) = send(state.clone(), "POST", "/api/grading", None, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let keys: Vec<String> = store.read().await.unwrap().into_keys().collect();
        assert_eq!(keys, vec!["admin-key"]);
        assert_eq!(cache.get(LAST_KEY_SLOT).await.unwrap(), None);

        // A later anonymous caller only ever reaches roster keys.
        let (status, _) = send(state, "POST", "/api/grading", None, Some(grading_body(None))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let keys: Vec<String> = store.read().await.unwrap().into_keys().collect();
        assert_eq!(keys, vec!["admin-key"]);
    }

    #[tokio::test]
    async fn key_routes_require_admin() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let (status, _) = send(state.clone(), "GET", "/api/keys", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(state.clone(), "GET", "/api/keys", Some("someone"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(
            state.clone(),
            "PUT",
            "/api/quota-document",
            Some("someone"),
            Some(json!({ "iaToken": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = send(state, "GET", "/api/keys", Some("admin"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn admin_registers_and_lists_keys_without_secrets() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let (status, body) = send(
            state.clone(),
            "POST",
            "/api/keys",
            Some("admin"),
            Some(json!({ "apiKey": "AIzaSecretValue" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["fingerprint"], key_fingerprint("AIzaSecretValue"));

        let (status, _) = send(
            state.clone(),
            "POST",
            "/api/keys",
            Some("admin"),
            Some(json!({ "apiKey": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(state, "GET", "/api/keys", Some("admin"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["preview"], "AIzaSe…");
        assert_eq!(body[0]["withinBudget"], true);
        assert!(!body.to_string().contains("AIzaSecretValue"));
    }

    #[tokio::test]
    async fn quota_document_import_then_export() {
        let override_auth = ForwardAuthConfig::new(None, None, None, Some("local".to_owned()));
        let state = state_with(Arc::new(MemoryQuotaStore::new()), override_auth);
        let document = json!({
            "iaToken": {
                "k1": { "tpm": 5, "lastTpmReset": 1, "rpm": "2", "rtotal": 9 }
            }
        });
        let (status, body) = send(
            state.clone(),
            "PUT",
            "/api/quota-document",
            None,
            Some(document),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["imported"], 1);

        let (status, body) = send(state, "GET", "/api/quota-document", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["iaToken"]["k1"]["tpm"], 5);
        assert_eq!(body["iaToken"]["k1"]["rpm"], 2);
        assert_eq!(body["iaToken"]["k1"]["rtotal"], 9);
        assert_eq!(body["iaToken"]["k1"]["rpd"], 0);
    }

    #[tokio::test]
    async fn profile_reflects_forward_auth() {
        let state = state_with(Arc::new(MemoryQuotaStore::new()), admin_auth());
        let (_, body) = send(state.clone(), "GET", "/api/profile", Some("admin"), None).await;
        assert_eq!(body, json!({ "displayName": "admin", "isAdmin": true }));
        let (_, body) = send(state, "GET", "/api/profile", None, None).await;
        assert_eq!(body, json!({ "displayName": null, "isAdmin": false }));
    }
}
