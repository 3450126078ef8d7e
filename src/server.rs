//! Escalation endpoint: `POST /api/alert-operator`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{EscalationConfig, ServerConfig};
use crate::models::EscalationEvent;
use crate::monitor::crossed_threshold;
use crate::notifier::{render, AlertRequest, AlertResponse, MailTransport};

#[derive(Clone)]
pub struct AppState {
    pub escalation: Arc<EscalationConfig>,
    pub transport: Arc<dyn MailTransport>,
}

impl AppState {
    pub fn new(escalation: EscalationConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            escalation: Arc::new(escalation),
            transport,
        }
    }
}

#[derive(Debug)]
pub enum AlertError {
    Validation(String),
    MethodNotAllowed,
    Delivery(String),
}

impl IntoResponse for AlertError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AlertError::Validation(message) => (StatusCode::BAD_REQUEST, message, None),
            AlertError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed".to_string(),
                None,
            ),
            AlertError::Delivery(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to send escalation email".to_string(),
                Some(details),
            ),
        };

        let mut body = json!({ "success": false, "error": error });
        if let Some(details) = details {
            body["details"] = json!(details);
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> AlertError {
    AlertError::MethodNotAllowed
}

async fn alert_operator(
    State(state): State<AppState>,
    payload: Result<Json<AlertRequest>, JsonRejection>,
) -> Result<Json<AlertResponse>, AlertError> {
    let Json(request) =
        payload.map_err(|rejection| AlertError::Validation(format!("Invalid JSON body: {rejection}")))?;

    let operator_name = request
        .operateur_nom
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AlertError::Validation("operateurNom is required".to_string()))?
        .to_string();
    let count = request
        .nombre_occurrences
        .ok_or_else(|| AlertError::Validation("nombreOccurrences is required".to_string()))?;
    let previous = request.previous_occurrences.unwrap_or(0);
    let now = Utc::now();

    let level = match request.escalation_level {
        Some(level) if state.escalation.template(level).is_some() => Some(level),
        Some(level) => {
            return Err(AlertError::Validation(format!(
                "escalationLevel {level} is not configured"
            )))
        }
        None => crossed_threshold(&state.escalation.thresholds(), previous, count),
    };

    let Some(level) = level else {
        info!(operator = %operator_name, previous, count, "no escalation threshold crossed");
        return Ok(Json(AlertResponse {
            success: true,
            message: Some("No escalation threshold crossed".to_string()),
            email_id: None,
            escalation_level: None,
            recipients: Vec::new(),
            timestamp: Some(now),
            error: None,
            details: None,
        }));
    };

    let template = state
        .escalation
        .template(level)
        .ok_or_else(|| AlertError::Delivery(format!("no template for level {level}")))?;
    let event = EscalationEvent {
        operator_name: operator_name.clone(),
        defect_count: count,
        previous_count: previous,
        threshold_level: level,
        defect_type: request.defect_type.clone(),
        occurred_at: request.timestamp.unwrap_or(now),
        operator_id: request.operator_id.clone(),
    };
    let email = render(template, &event);

    let message_id = state.transport.send(&email).await.map_err(|err| {
        error!(operator = %operator_name, level, error = %err, "escalation email failed");
        AlertError::Delivery(err.to_string())
    })?;

    info!(operator = %operator_name, level, message_id = %message_id, "escalation email sent");
    Ok(Json(AlertResponse {
        success: true,
        message: Some(format!(
            "Escalation level {level} ({}) sent for {operator_name}",
            template.label
        )),
        email_id: Some(message_id),
        escalation_level: Some(level),
        recipients: email.to,
        timestamp: Some(now),
        error: None,
        details: None,
    }))
}

fn cors_layer(allowed_origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

pub fn build_router(state: AppState, server: &ServerConfig) -> anyhow::Result<Router> {
    let alert = post(alert_operator)
        .options(preflight)
        .fallback(method_not_allowed);

    Ok(Router::new()
        .route("/api/alert-operator", alert)
        .route("/health", get(health_check))
        .layer(cors_layer(&server.allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

pub async fn serve(state: AppState, server: &ServerConfig) -> anyhow::Result<()> {
    let app = build_router(state, server)?;
    let listener = tokio::net::TcpListener::bind(&server.bind)
        .await
        .with_context(|| format!("failed to bind {}", server.bind))?;
    info!("escalation endpoint listening on http://{}/api/alert-operator", server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::util::ServiceExt;

    use super::*;
    use crate::error::NotifyError;
    use crate::notifier::testing::CapturingTransport;
    use crate::notifier::OutgoingEmail;

    struct BrokenTransport;

    #[async_trait::async_trait]
    impl MailTransport for BrokenTransport {
        async fn send(&self, _: &OutgoingEmail) -> Result<String, NotifyError> {
            Err(NotifyError::Mail("relay refused".into()))
        }
    }

    fn app(transport: Arc<dyn MailTransport>) -> Router {
        let state = AppState::new(EscalationConfig::default(), transport);
        build_router(state, &ServerConfig::default()).unwrap()
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/alert-operator")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn extract_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Should read body");
        serde_json::from_slice(&bytes).expect("Should parse JSON")
    }

    #[tokio::test]
    async fn crossing_sends_highest_level() {
        let transport = Arc::new(CapturingTransport::default());
        let response = app(transport.clone())
            .oneshot(post_json(json!({
                "operateurNom": "Samira Benali",
                "nombreOccurrences": 8,
                "previousOccurrences": 2,
                "defectType": "Fils inversés"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = extract_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["escalationLevel"], 7);
        assert_eq!(body["emailId"], "mail-1");
        assert_eq!(body["recipients"].as_array().unwrap().len(), 3);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_crossing_sends_nothing() {
        let transport = Arc::new(CapturingTransport::default());
        let response = app(transport.clone())
            .oneshot(post_json(json!({
                "operateurNom": "Samira Benali",
                "nombreOccurrences": 4,
                "previousOccurrences": 3
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = extract_json(response).await;
        assert_eq!(body["escalationLevel"], Value::Null);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forced_level_bypasses_counts() {
        let transport = Arc::new(CapturingTransport::default());
        let response = app(transport.clone())
            .oneshot(post_json(json!({
                "operateurNom": "Lucas Moreau",
                "nombreOccurrences": 1,
                "escalationLevel": 5
            })))
            .await
            .unwrap();

        let body = extract_json(response).await;
        assert_eq!(body["escalationLevel"], 5);
        assert_eq!(body["recipients"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_operator_is_bad_request() {
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(post_json(json!({"nombreOccurrences": 3})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = extract_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "operateurNom is required");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/alert-operator")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_forced_level_is_rejected() {
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(post_json(json!({
                "operateurNom": "Lucas Moreau",
                "nombreOccurrences": 9,
                "escalationLevel": 9
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn transport_failure_is_server_error() {
        let response = app(Arc::new(BrokenTransport))
            .oneshot(post_json(json!({
                "operateurNom": "Samira Benali",
                "nombreOccurrences": 3,
                "previousOccurrences": 0
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = extract_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["details"].as_str().unwrap().contains("relay refused"));
    }

    #[tokio::test]
    async fn wrong_method_is_405_json() {
        let request = Request::builder()
            .method("GET")
            .uri("/api/alert-operator")
            .body(Body::empty())
            .unwrap();
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = extract_json(response).await;
        assert_eq!(body["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn preflight_allows_local_dev_origin() {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/alert-operator")
            .header("origin", "http://localhost:8081")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:8081"
        );
    }

    #[tokio::test]
    async fn health_reports_module() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app(Arc::new(CapturingTransport::default()))
            .oneshot(request)
            .await
            .unwrap();
        let body = extract_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["module"], "defect-escalation-tracker");
    }

    async fn spawn_endpoint(transport: Arc<dyn MailTransport>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(transport)).await.unwrap();
        });
        format!("http://{addr}/api/alert-operator")
    }

    fn escalation_event(level: u32) -> EscalationEvent {
        EscalationEvent {
            operator_name: "Samira Benali".into(),
            defect_count: 5,
            previous_count: 4,
            threshold_level: level,
            defect_type: Some("Fils inversés".into()),
            occurred_at: Utc::now(),
            operator_id: Some("M-118".into()),
        }
    }

    #[tokio::test]
    async fn http_notifier_delivers_through_the_endpoint() {
        use crate::notifier::{HttpNotifier, Notifier};

        let transport = Arc::new(CapturingTransport::default());
        let endpoint = spawn_endpoint(transport.clone()).await;
        let notifier = HttpNotifier::new(endpoint, std::time::Duration::from_secs(5)).unwrap();

        let delivery = notifier.notify(&escalation_event(5)).await.unwrap();
        assert_eq!(delivery.message_id.as_deref(), Some("mail-1"));
        assert_eq!(delivery.recipients.len(), 2);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Fils inversés"));
    }

    #[tokio::test]
    async fn http_notifier_reports_rejections() {
        use crate::notifier::{HttpNotifier, Notifier};

        let endpoint = spawn_endpoint(Arc::new(CapturingTransport::default())).await;
        let notifier = HttpNotifier::new(endpoint, std::time::Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&escalation_event(4)).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 400, .. }));

        let endpoint = spawn_endpoint(Arc::new(BrokenTransport)).await;
        let notifier = HttpNotifier::new(endpoint, std::time::Duration::from_secs(5)).unwrap();
        let err = notifier.notify(&escalation_event(7)).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn monitor_escalates_over_http_at_the_crossed_level() {
        use crate::monitor::{OperatorContext, ThresholdMonitor, ThresholdState};
        use crate::notifier::HttpNotifier;

        let transport = Arc::new(CapturingTransport::default());
        let endpoint = spawn_endpoint(transport.clone()).await;
        let notifier = HttpNotifier::new(endpoint, std::time::Duration::from_secs(5)).unwrap();
        let mut monitor =
            ThresholdMonitor::new(ThresholdState::default(), vec![7, 5, 3], Arc::new(notifier));

        assert!(monitor
            .observe("Samira Benali", 2, &OperatorContext::default())
            .await
            .is_none());
        let escalation = monitor
            .observe("Samira Benali", 6, &OperatorContext::default())
            .await
            .unwrap();

        assert_eq!(escalation.event.threshold_level, 5);
        assert!(escalation.outcome.success);
        assert_eq!(escalation.outcome.message_id.as_deref(), Some("mail-1"));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to.len(), 2);
    }
}