use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use frontdesk_agent::conversation::{Response as TurnResponse, TurnMetadata};
use frontdesk_agent::runtime::{AgentRuntime, RoutingOutcome};
use frontdesk_core::domain::business::BusinessId;
use frontdesk_core::domain::call::{Call, CallId, CallMetrics, IncomingCall};
use frontdesk_core::domain::conversation::{
    Channel, Conversation, ConversationId, CustomerId, Intent, Message,
};
use frontdesk_core::domain::routing::{AgentProfile, Route, RouteStats, RoutingRule};
use frontdesk_core::domain::workflow::{
    ExecutionId, ExecutionRequest, WorkflowDefinition, WorkflowExecution,
};
use frontdesk_core::errors::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<AgentRuntime>,
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/calls/route", post(route_call))
        .route("/calls/active", get(active_calls))
        .route("/calls/history", get(call_history))
        .route("/calls/metrics", get(call_metrics))
        .route("/calls/{call_id}", get(get_call))
        .route("/calls/{call_id}/answer", post(answer_call))
        .route("/calls/{call_id}/audio", post(call_audio))
        .route("/calls/{call_id}/hold", post(hold_call))
        .route("/calls/{call_id}/resume", post(resume_call))
        .route("/calls/{call_id}/end", post(end_call))
        .route("/conversations", post(start_conversation))
        .route("/conversations/{conversation_id}", get(get_conversation))
        .route("/conversations/{conversation_id}/messages", post(send_message))
        .route("/conversations/{conversation_id}/history", get(conversation_history))
        .route("/conversations/{conversation_id}/end", post(end_conversation))
        .route("/routes", get(list_routes).post(register_route))
        .route("/routes/stats", get(route_stats))
        .route("/rules", get(list_rules).post(add_rule))
        .route("/workflows", post(register_workflow))
        .route("/workflows/{business_id}", get(list_workflows))
        .route("/executions", post(start_execution))
        .route("/executions/{execution_id}", get(execution_status))
        .route("/executions/{execution_id}/cancel", post(cancel_execution))
        .with_state(ApiState { runtime })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError(InterfaceError);

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub detail: Option<String>,
    pub correlation_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, Some(message.clone())),
            InterfaceError::NotFound { message, .. } => (StatusCode::NOT_FOUND, Some(message.clone())),
            InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = %self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request rejected"
            );
        }

        let body = ApiErrorBody {
            error: self.0.user_message().to_string(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

trait Correlate<T> {
    fn correlate(self, correlation_id: &str) -> Result<T, ApiError>;
}

impl<T> Correlate<T> for Result<T, ApplicationError> {
    fn correlate(self, correlation_id: &str) -> Result<T, ApiError> {
        self.map_err(|error| ApiError(error.into_interface(correlation_id)))
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", uuid::Uuid::new_v4()))
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RouteCallRequest {
    pub from_number: String,
    pub to_number: String,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub business_id: Option<BusinessId>,
    #[serde(default)]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Serialize)]
pub struct AnsweredCallBody {
    pub call: Call,
    pub greeting: String,
    pub audio_base64: String,
}

#[derive(Debug, Serialize)]
pub struct AudioTurnBody {
    pub transcript: String,
    pub reply: String,
    pub audio_base64: String,
    pub intent: Option<Intent>,
    pub should_transfer: bool,
    pub transfer_reason: Option<String>,
    pub call_ended: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn route_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RouteCallRequest>,
) -> ApiResult<RoutingOutcome> {
    let correlation_id = correlation_id(&headers);
    let mut incoming = IncomingCall::new(request.from_number, request.to_number);
    incoming.caller_name = request.caller_name;
    incoming.business_id = request.business_id;
    incoming.call_id = request.call_id;

    state.runtime.route_call(incoming).await.correlate(&correlation_id).map(Json)
}

async fn answer_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> ApiResult<AnsweredCallBody> {
    let correlation_id = correlation_id(&headers);
    let answered = state.runtime.phone().answer(&CallId(call_id)).await.correlate(&correlation_id)?;
    Ok(Json(AnsweredCallBody {
        call: answered.call,
        greeting: answered.greeting,
        audio_base64: STANDARD.encode(answered.audio),
    }))
}

async fn call_audio(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
    body: Bytes,
) -> ApiResult<AudioTurnBody> {
    let correlation_id = correlation_id(&headers);
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");

    let turn = state
        .runtime
        .phone()
        .process_audio_input(&CallId(call_id), &body, mime_type)
        .await
        .correlate(&correlation_id)?;
    Ok(Json(AudioTurnBody {
        transcript: turn.transcript,
        reply: turn.reply,
        audio_base64: STANDARD.encode(turn.audio_reply),
        intent: turn.intent,
        should_transfer: turn.should_transfer,
        transfer_reason: turn.transfer_reason,
        call_ended: turn.call_ended,
    }))
}

async fn hold_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> ApiResult<Call> {
    let correlation_id = correlation_id(&headers);
    state.runtime.phone().hold_call(&CallId(call_id)).await.correlate(&correlation_id).map(Json)
}

async fn resume_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> ApiResult<Call> {
    let correlation_id = correlation_id(&headers);
    state.runtime.phone().resume_call(&CallId(call_id)).await.correlate(&correlation_id).map(Json)
}

async fn end_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
    request: Option<Json<EndRequest>>,
) -> ApiResult<Call> {
    let correlation_id = correlation_id(&headers);
    let reason = request.and_then(|Json(request)| request.reason).unwrap_or_else(|| "hangup".to_string());
    state.runtime.phone().end_call(&CallId(call_id), &reason).await.correlate(&correlation_id).map(Json)
}

async fn get_call(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(call_id): Path<String>,
) -> ApiResult<Call> {
    let correlation_id = correlation_id(&headers);
    state.runtime.phone().call(&CallId(call_id)).await.correlate(&correlation_id).map(Json)
}

async fn active_calls(State(state): State<ApiState>) -> Json<Vec<Call>> {
    Json(state.runtime.phone().active_calls().await)
}

async fn call_history(State(state): State<ApiState>) -> Json<Vec<Call>> {
    Json(state.runtime.phone().call_history().await)
}

async fn call_metrics(State(state): State<ApiState>) -> Json<CallMetrics> {
    Json(state.runtime.phone().metrics().await)
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    pub business_id: BusinessId,
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    #[serde(default = "default_channel")]
    pub channel: Channel,
}

fn default_channel() -> Channel {
    Channel::Chat
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
    #[serde(default)]
    pub transcript_confidence: Option<f32>,
}

async fn start_conversation(
    State(state): State<ApiState>,
    Json(request): Json<StartConversationRequest>,
) -> (StatusCode, Json<Conversation>) {
    let conversation = state
        .runtime
        .conversations()
        .start_conversation(request.business_id, request.customer_id, request.channel)
        .await;
    (StatusCode::CREATED, Json(conversation))
}

async fn get_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Conversation> {
    let correlation_id = correlation_id(&headers);
    state
        .runtime
        .conversations()
        .get(&ConversationId(conversation_id))
        .await
        .correlate(&correlation_id)
        .map(Json)
}

async fn send_message(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<TurnResponse> {
    let correlation_id = correlation_id(&headers);
    let metadata = TurnMetadata {
        transcript_confidence: request.transcript_confidence,
        correlation_id: Some(correlation_id.clone()),
    };
    state
        .runtime
        .conversations()
        .process_message(&ConversationId(conversation_id), &request.text, metadata)
        .await
        .correlate(&correlation_id)
        .map(Json)
}

async fn conversation_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Vec<Message>> {
    let correlation_id = correlation_id(&headers);
    state
        .runtime
        .conversations()
        .history(&ConversationId(conversation_id))
        .await
        .correlate(&correlation_id)
        .map(Json)
}

async fn end_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    request: Option<Json<EndRequest>>,
) -> ApiResult<Conversation> {
    let correlation_id = correlation_id(&headers);
    let reason =
        request.and_then(|Json(request)| request.reason).unwrap_or_else(|| "ended_by_operator".to_string());
    state
        .runtime
        .conversations()
        .end(&ConversationId(conversation_id), &reason)
        .await
        .correlate(&correlation_id)
        .map(Json)
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub business_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRouteRequest {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub agent: AgentProfile,
    #[serde(default)]
    pub business_id: Option<BusinessId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_default: bool,
}

impl RegisterRouteRequest {
    fn into_route(self) -> Route {
        let mut route = Route::new(self.id, self.name, self.pattern, self.agent).with_priority(self.priority);
        if let Some(business_id) = self.business_id {
            route = route.scoped_to(business_id);
        }
        if self.is_default {
            route = route.as_default();
        }
        route
    }
}

async fn list_routes(State(state): State<ApiState>, Query(query): Query<RouteQuery>) -> Json<Vec<Route>> {
    let business_id = query.business_id.map(BusinessId);
    Json(state.runtime.router().routes(business_id.as_ref()).await)
}

async fn register_route(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<RegisterRouteRequest>,
) -> Result<(StatusCode, Json<Route>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let route = state.runtime.router().register_route(request.into_route()).await.correlate(&correlation_id)?;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn route_stats(State(state): State<ApiState>) -> Json<Vec<RouteStats>> {
    Json(state.runtime.router().route_stats().await)
}

async fn list_rules(State(state): State<ApiState>) -> Json<Vec<RoutingRule>> {
    Json(state.runtime.router().rules().await)
}

async fn add_rule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(rule): Json<RoutingRule>,
) -> Result<StatusCode, ApiError> {
    let correlation_id = correlation_id(&headers);
    state.runtime.router().add_rule(rule).await.correlate(&correlation_id)?;
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn register_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<WorkflowDefinition>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let registered =
        state.runtime.workflows().register_workflow(definition).await.correlate(&correlation_id)?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn list_workflows(
    State(state): State<ApiState>,
    Path(business_id): Path<String>,
) -> Json<Vec<WorkflowDefinition>> {
    Json(state.runtime.workflows().workflows(&BusinessId(business_id)).await)
}

async fn start_execution(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ExecutionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let execution_id = state.runtime.workflows().execute(request).await.correlate(&correlation_id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "execution_id": execution_id }))))
}

async fn execution_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
) -> ApiResult<WorkflowExecution> {
    let correlation_id = correlation_id(&headers);
    state
        .runtime
        .workflows()
        .get_execution_status(&ExecutionId(execution_id))
        .await
        .correlate(&correlation_id)
        .map(Json)
}

async fn cancel_execution(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let correlation_id = correlation_id(&headers);
    let cancelled = state
        .runtime
        .workflows()
        .cancel_execution(&ExecutionId(execution_id))
        .await
        .correlate(&correlation_id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use frontdesk_agent::codec::TextPassthroughCodec;
    use frontdesk_agent::runtime::AgentRuntime;
    use frontdesk_core::audit::InMemoryAuditSink;
    use frontdesk_core::config::{AppConfig, MessagingConfig};
    use frontdesk_core::domain::routing::{AgentProfile, Route};
    use frontdesk_db::{demo_business, InMemoryBusinessDataProvider, DEMO_BUSINESS_ID};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, CORRELATION_HEADER};
    use crate::messaging::RelayMessagingProvider;

    async fn app() -> Router {
        let config = AppConfig::default();
        let messaging = RelayMessagingProvider::from_config(&MessagingConfig {
            relay_url: None,
            api_key: None,
            webhook_signing_secret: None,
            timeout_secs: 5,
        })
        .expect("messaging");
        let runtime = AgentRuntime::new(
            &config,
            Arc::new(InMemoryBusinessDataProvider::seeded([demo_business()])),
            Arc::new(TextPassthroughCodec),
            Arc::new(messaging),
            Arc::new(InMemoryAuditSink::default()),
        )
        .expect("runtime");
        runtime
            .router()
            .register_route(
                Route::new(
                    "main",
                    "Main line",
                    "*",
                    AgentProfile {
                        agent_id: "front".to_string(),
                        display_name: "Riley".to_string(),
                        greeting: None,
                        voice: None,
                    },
                )
                .scoped_to(frontdesk_core::domain::business::BusinessId(DEMO_BUSINESS_ID.to_string()))
                .as_default(),
            )
            .await
            .expect("route");
        router(Arc::new(runtime))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json") };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn call_flow_from_routing_to_hang_up() {
        let app = app().await;

        let (status, outcome) =
            send(&app, post_json("/calls/route", json!({ "from_number": "+15551234567", "to_number": "+15550000000" })))
                .await;
        assert_eq!(status, StatusCode::OK);
        let call_id = outcome["call"]["id"].as_str().expect("call id").to_string();
        assert_eq!(outcome["decision"]["used_fallback"], json!(false));

        let (status, answered) =
            send(&app, Request::post(format!("/calls/{call_id}/answer")).body(Body::empty()).expect("request")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(answered["greeting"].as_str().expect("greeting").contains("Reyes Plumbing"));

        let (status, turn) = send(
            &app,
            Request::post(format!("/calls/{call_id}/audio"))
                .header("content-type", "text/plain")
                .body(Body::from("what services do you offer?"))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["intent"], json!("service_inquiry"));
        assert_eq!(turn["should_transfer"], json!(false));
        assert_eq!(turn["call_ended"], json!(false));

        let (status, ended) = send(&app, post_json(&format!("/calls/{call_id}/end"), json!({ "reason": "caller_hung_up" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["status"], json!("completed"));

        let (_, metrics) = send(&app, Request::get("/calls/metrics").body(Body::empty()).expect("request")).await;
        assert_eq!(metrics["total_calls"], json!(1));
        assert_eq!(metrics["answered_calls"], json!(1));
    }

    #[tokio::test]
    async fn unknown_call_is_not_found_with_correlation_id() {
        let app = app().await;

        let (status, body) = send(
            &app,
            Request::post("/calls/call-missing/answer")
                .header(CORRELATION_HEADER, "req-42")
                .body(Body::empty())
                .expect("request"),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["correlation_id"], json!("req-42"));
        assert_eq!(body["error"], json!("The requested resource does not exist."));
    }

    #[tokio::test]
    async fn conversation_messages_are_recorded_in_history() {
        let app = app().await;

        let (status, conversation) =
            send(&app, post_json("/conversations", json!({ "business_id": DEMO_BUSINESS_ID, "channel": "chat" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = conversation["id"].as_str().expect("conversation id").to_string();

        let (status, reply) =
            send(&app, post_json(&format!("/conversations/{id}/messages"), json!({ "text": "What are your hours?" })))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert!(reply["text"].as_str().expect("reply").contains("Mon-Fri 8am-6pm"));

        let (_, history) =
            send(&app, Request::get(format!("/conversations/{id}/history")).body(Body::empty()).expect("request")).await;
        assert_eq!(history.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn workflow_registration_and_manual_execution() {
        let app = app().await;

        let definition = json!({
            "id": "daily-note",
            "business_id": DEMO_BUSINESS_ID,
            "name": "Daily note",
            "trigger": { "type": "manual" },
            "actions": [{ "id": "note", "action_type": "log", "parameters": { "message": "hello" } }],
        });
        let (status, registered) = send(&app, post_json("/workflows", definition)).await;
        assert_eq!(status, StatusCode::CREATED, "{registered}");
        assert_eq!(registered["version"], json!(1));

        let (_, listed) =
            send(&app, Request::get(format!("/workflows/{DEMO_BUSINESS_ID}")).body(Body::empty()).expect("request"))
                .await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let (status, started) = send(
            &app,
            post_json(
                "/executions",
                json!({ "workflow_id": "daily-note", "business_id": DEMO_BUSINESS_ID, "triggered_by": "api" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let execution_id = started["execution_id"].as_str().expect("execution id").to_string();

        let (status, execution) =
            send(&app, Request::get(format!("/executions/{execution_id}")).body(Body::empty()).expect("request")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(execution["status"], json!("pending"));

        let (status, cancelled) =
            send(&app, Request::post(format!("/executions/{execution_id}/cancel")).body(Body::empty()).expect("request"))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["cancelled"], json!(false));
    }
}
