use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Number, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::normalize::{extract_conversation_status, is_finished_status, normalize};

const START_TYPE: &str = "conversation_start";
const END_TYPE: &str = "conversation_end";

// Where webhook replies keep their text, most specific first. Checked before
// the general normalizer so `response` beats `message`.
const REPLY_POINTERS: [&str; 11] = [
    "/0/output",
    "/response",
    "/message",
    "/reply",
    "/text",
    "/output",
    "/data/response",
    "/body/response",
    "/body/message",
    "/0/response",
    "/0/message",
];

pub struct ProxyState {
    config: Config,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self { config, client })
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(
            "/chat",
            post(chat_handler)
                .options(|| async { StatusCode::OK })
                .fallback(method_not_allowed),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[derive(Debug, Serialize)]
struct ProxyReply {
    success: bool,
    message: String,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback: Option<bool>,
}

impl ProxyReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
            conversation_status: None,
            fallback: None,
        }
    }

    fn fallback(message: impl Into<String>) -> Self {
        Self {
            fallback: Some(true),
            ..Self::ok(message)
        }
    }
}

impl IntoResponse for ProxyReply {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Body sent to the webhook.
#[derive(Debug, Default, Serialize)]
struct WebhookPayload {
    timestamp: String,
    user_id: Value,
    source: String,
    #[serde(rename = "type")]
    kind: String,
    origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_email: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_phone: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_new_conversation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_count: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_message_count: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_started_at: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_timestamp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_messages: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_duration: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at: Option<Value>,
}

impl WebhookPayload {
    fn build(data: &Value, kind: Option<&str>, origin: &str, source: &str) -> Self {
        let mut payload = Self {
            timestamp: Utc::now().to_rfc3339(),
            user_id: truthy(data, "user_id").unwrap_or_else(|| json!("anonymous")),
            source: source.to_string(),
            kind: kind.unwrap_or("chat_message").to_string(),
            origin: origin.to_string(),
            user_name: truthy(data, "user_name"),
            user_email: truthy(data, "user_email"),
            user_phone: truthy(data, "user_phone"),
            conversation_id: truthy(data, "conversation_id"),
            is_new_conversation: data.get("is_new_conversation").and_then(Value::as_bool),
            conversation_started_at: truthy(data, "conversation_started_at"),
            ..Self::default()
        };

        payload.message = match kind {
            Some(START_TYPE) => Some("Conversation started".to_string()),
            _ => match text_field(data, "message") {
                Some(message) => Some(message.to_string()),
                None if kind == Some(END_TYPE) => Some("Conversation ended".to_string()),
                None => None,
            },
        };

        if let Some(count) = number(data, "message_count") {
            payload.previous_message_count = Some(count.clone());
            payload.message_count = Some(count);
        }

        match kind {
            Some(START_TYPE) => payload.client_timestamp = truthy(data, "timestamp"),
            Some(END_TYPE) => {
                payload.total_messages = number(data, "total_messages");
                payload.conversation_duration = number(data, "conversation_duration");
                payload.ended_at = truthy(data, "ended_at");
            }
            _ => {}
        }

        payload
    }
}

async fn chat_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let data: Value = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            error!("Chatbot error: invalid request body: {}", e);
            return ProxyReply::fallback(state.config.connectivity_message()).into_response();
        }
    };

    let kind = data.get("type").and_then(Value::as_str);
    match kind {
        Some(START_TYPE) => {
            if text_field(&data, "user_name").is_none() {
                return bad_request("User name is required for conversation start");
            }
            if text_field(&data, "user_email").is_none() {
                return bad_request("User email is required for conversation start");
            }
        }
        // End markers come from unload handlers and carry no text.
        Some(END_TYPE) => {}
        _ => {
            if text_field(&data, "message").is_none() {
                return bad_request("Message is required");
            }
        }
    }

    let Some(webhook_url) = state.config.webhook_url.as_deref() else {
        error!("CHATBOT_WEBHOOK_URL is not set");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Configuration error" })),
        )
            .into_response();
    };

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let payload = WebhookPayload::build(&data, kind, origin, &state.config.source);

    match forward(&state, webhook_url, &payload).await {
        Ok(reply) => reply.into_response(),
        Err(e) => {
            error!("Chatbot error: {:#}", e);
            ProxyReply::fallback(state.config.connectivity_message()).into_response()
        }
    }
}

async fn forward(
    state: &ProxyState,
    webhook_url: &str,
    payload: &WebhookPayload,
) -> anyhow::Result<ProxyReply> {
    debug!(
        "Forwarding {} for conversation {:?}",
        payload.kind, payload.conversation_id
    );

    let response = state
        .client
        .post(webhook_url)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/json, text/plain, */*")
        .json(payload)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("Request timeout - please try again")
            } else {
                anyhow::Error::new(e)
            }
        })?;

    // Markers are acknowledged whatever the webhook answered.
    match payload.kind.as_str() {
        START_TYPE => return Ok(ProxyReply::ok("Conversation started")),
        END_TYPE => return Ok(ProxyReply::ok("Conversation ended")),
        _ => {}
    }

    let status = response.status();
    if !status.is_success() {
        error!("Webhook error: {} - URL: {}", status, webhook_url);
        if status == reqwest::StatusCode::NOT_FOUND {
            error!("Webhook endpoint not found. Please verify CHATBOT_WEBHOOK_URL is correct.");
            return Ok(ProxyReply::fallback(format!(
                "Thanks for your message! We'll get back to you soon. You can also reach us at {}",
                state.config.contact_email
            )));
        }
        anyhow::bail!("Webhook responded with status: {}", status.as_u16());
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.contains("application/json"));

    let (message, conversation_status) = match response.text().await {
        Ok(body) if is_json => match serde_json::from_str::<Value>(&body) {
            Ok(data) => {
                let parsed = normalize(&data).unwrap_or_default();
                let status = extract_conversation_status(&data, Some(&parsed));
                if is_finished_status(status.as_deref()) {
                    debug!("Webhook reported the conversation as finished");
                }
                (reply_text(&data).or(parsed.message), status)
            }
            Err(e) => {
                warn!("Response parsing error: {}", e);
                (None, None)
            }
        },
        Ok(body) => (Some(body).filter(|b| !b.is_empty()), None),
        Err(e) => {
            warn!("Response parsing error: {}", e);
            (None, None)
        }
    };

    let mut reply = ProxyReply::ok(message.unwrap_or_else(|| {
        format!(
            "I'm here to help! How can I assist you with {} today?",
            state.config.brand
        )
    }));
    reply.conversation_status = conversation_status;
    Ok(reply)
}

fn reply_text(data: &Value) -> Option<String> {
    REPLY_POINTERS
        .iter()
        .filter_map(|pointer| data.pointer(pointer))
        .filter_map(Value::as_str)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// Non-empty (after trimming) string field, trimmed.
fn text_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn truthy(data: &Value, key: &str) -> Option<Value> {
    data.get(key)
        .filter(|v| match v {
            Value::Null | Value::Bool(false) => false,
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
            _ => true,
        })
        .cloned()
}

fn number(data: &Value, key: &str) -> Option<Number> {
    match data.get(key) {
        Some(Value::Number(n)) => Some(n.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::store::{ConversationRecord, MemorySessionStore};
    use crate::transport::HttpTransport;
    use crate::widget::{AppContext, ChatWidget, SendOutcome};
    use axum::routing::post;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct FakeWebhook {
        status: StatusCode,
        content_type: &'static str,
        body: String,
        received: Arc<Mutex<Vec<Value>>>,
    }

    impl FakeWebhook {
        fn new(status: StatusCode, content_type: &'static str, body: impl Into<String>) -> Self {
            Self {
                status,
                content_type,
                body: body.into(),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn json(body: Value) -> Self {
            Self::new(StatusCode::OK, "application/json", body.to_string())
        }
    }

    async fn webhook_handler(
        State(hook): State<FakeWebhook>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        hook.received.lock().await.push(body);
        (
            hook.status,
            [(header::CONTENT_TYPE, hook.content_type)],
            hook.body.clone(),
        )
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Starts a webhook and a proxy pointing at it; returns the proxy's chat URL.
    async fn proxy_with(hook: &FakeWebhook) -> String {
        let webhook = serve(
            Router::new()
                .route("/hook", post(webhook_handler))
                .with_state(hook.clone()),
        )
        .await;
        let config = Config {
            webhook_url: Some(format!("{}/hook", webhook)),
            ..Config::default()
        };
        let proxy = serve(router(Arc::new(ProxyState::new(config).unwrap()))).await;
        format!("{}/chat", proxy)
    }

    async fn post_json(url: &str, body: Value) -> (reqwest::StatusCode, Value) {
        let response = reqwest::Client::new()
            .post(url)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn chat_turn_is_enriched_and_reply_normalized() {
        let hook = FakeWebhook::json(json!([{"output": {"output": "Hi there", "status": "finished"}}]));
        let url = proxy_with(&hook).await;

        let (status, body) = post_json(
            &url,
            json!({
                "message": "  hello  ",
                "type": "chat_message",
                "user_name": "Jo",
                "conversation_id": "conv_1",
                "message_count": 2,
                "is_new_conversation": false
            }),
        )
        .await;

        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Hi there");
        assert_eq!(body["conversation_status"], "finished");

        let received = hook.received.lock().await;
        let forwarded = &received[0];
        assert_eq!(forwarded["message"], "hello");
        assert_eq!(forwarded["user_id"], "anonymous");
        assert_eq!(forwarded["origin"], "unknown");
        assert_eq!(forwarded["source"], "Parley Chat");
        assert_eq!(forwarded["message_count"], 2);
        assert_eq!(forwarded["previous_message_count"], 2);
        assert_eq!(forwarded["is_new_conversation"], false);
        assert!(forwarded.get("user_email").is_none());
    }

    #[tokio::test]
    async fn missing_message_is_rejected() {
        let hook = FakeWebhook::json(json!({}));
        let url = proxy_with(&hook).await;

        let (status, body) = post_json(&url, json!({"message": "   "})).await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Message is required");
        assert!(hook.received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn start_requires_name_and_email() {
        let hook = FakeWebhook::json(json!({}));
        let url = proxy_with(&hook).await;

        let (status, body) =
            post_json(&url, json!({"type": "conversation_start", "user_name": "Jo"})).await;
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "User email is required for conversation start");
    }

    #[tokio::test]
    async fn markers_are_forwarded_and_acknowledged() {
        let hook = FakeWebhook::new(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "boom");
        let url = proxy_with(&hook).await;

        let (_, body) = post_json(
            &url,
            json!({
                "type": "conversation_start",
                "user_name": "Jo",
                "user_email": "jo@x.com",
                "timestamp": "2026-01-01T00:00:00Z"
            }),
        )
        .await;
        assert_eq!(body["message"], "Conversation started");

        let (_, body) = post_json(
            &url,
            json!({"type": "conversation_end", "total_messages": 3, "conversation_duration": 40}),
        )
        .await;
        assert_eq!(body["message"], "Conversation ended");

        let received = hook.received.lock().await;
        assert_eq!(received[0]["message"], "Conversation started");
        assert_eq!(received[0]["client_timestamp"], "2026-01-01T00:00:00Z");
        assert_eq!(received[1]["message"], "Conversation ended");
        assert_eq!(received[1]["total_messages"], 3);
        assert_eq!(received[1]["conversation_duration"], 40);
    }

    #[tokio::test]
    async fn missing_webhook_is_a_configuration_error() {
        let proxy = serve(router(Arc::new(ProxyState::new(Config::default()).unwrap()))).await;

        let (status, body) = post_json(&format!("{}/chat", proxy), json!({"message": "hi"})).await;
        assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Configuration error");
    }

    #[tokio::test]
    async fn webhook_not_found_gets_a_thank_you() {
        let hook = FakeWebhook::new(StatusCode::NOT_FOUND, "text/plain", "");
        let url = proxy_with(&hook).await;

        let (status, body) = post_json(&url, json!({"message": "hi"})).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body["fallback"], true);
        assert!(body["message"].as_str().unwrap().starts_with("Thanks for your message!"));
    }

    #[tokio::test]
    async fn webhook_failure_gets_connectivity_fallback() {
        let hook = FakeWebhook::new(StatusCode::BAD_GATEWAY, "text/plain", "");
        let url = proxy_with(&hook).await;

        let (status, body) = post_json(&url, json!({"message": "hi"})).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body["fallback"], true);
        assert_eq!(body["message"], Config::default().connectivity_message());
    }

    #[tokio::test]
    async fn malformed_request_gets_fallback() {
        let hook = FakeWebhook::json(json!({}));
        let url = proxy_with(&hook).await;

        let response = reqwest::Client::new()
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["fallback"], true);
    }

    #[tokio::test]
    async fn text_and_empty_replies() {
        let hook = FakeWebhook::new(StatusCode::OK, "text/plain", "Plain answer");
        let url = proxy_with(&hook).await;
        let (_, body) = post_json(&url, json!({"message": "hi"})).await;
        assert_eq!(body["message"], "Plain answer");

        let hook = FakeWebhook::json(json!({"success": true}));
        let url = proxy_with(&hook).await;
        let (_, body) = post_json(&url, json!({"message": "hi"})).await;
        assert_eq!(
            body["message"],
            "I'm here to help! How can I assist you with ClinicIQ Solutions today?"
        );
        assert!(body.get("conversation_status").is_none());
    }

    #[tokio::test]
    async fn wrapped_replies_are_unwrapped() {
        let cases = [
            (json!({"body": {"message": "from body"}}), "from body"),
            (json!({"data": {"response": "from data"}}), "from data"),
            (json!({"message": "second", "response": "first"}), "first"),
            (json!([{"response": "from item"}]), "from item"),
            (json!({"output": {"message": "nested"}}), "nested"),
        ];

        for (reply, expected) in cases {
            let hook = FakeWebhook::json(reply.clone());
            let url = proxy_with(&hook).await;
            let (_, body) = post_json(&url, json!({"message": "hi"})).await;
            assert_eq!(body["message"], expected, "reply {reply}");
        }
    }

    #[tokio::test]
    async fn nested_status_is_passed_through() {
        let hook = FakeWebhook::json(json!({"data": {"status": "finished"}, "message": "Bye"}));
        let url = proxy_with(&hook).await;

        let (_, body) = post_json(&url, json!({"message": "thanks"})).await;
        assert_eq!(body["message"], "Bye");
        assert_eq!(body["conversation_status"], "finished");
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let hook = FakeWebhook::json(json!({}));
        let url = proxy_with(&hook).await;

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn widget_finishes_through_the_proxy() {
        let hook = FakeWebhook::json(json!([{"output": {"output": "Goodbye!", "status": "Finished"}}]));
        let url = proxy_with(&hook).await;

        let config = Config {
            function_url: url.clone(),
            ..Config::default()
        };
        let transport = Arc::new(HttpTransport::new(url, Duration::from_secs(5)));
        let widget = ChatWidget::new(AppContext {
            config,
            record: ConversationRecord::new(Arc::new(MemorySessionStore::new())),
            transport: transport.clone(),
            bus: Arc::new(EventBus::new()),
        });

        widget.open().await;
        widget.submit_identification("Jo", "jo@x.com", "").await;
        assert_eq!(widget.send_message("that's all").await, SendOutcome::Finished);

        let view = widget.view();
        assert_eq!(view.messages().last().unwrap().content, "Goodbye!");
        assert_eq!(view.finish_actions().len(), 1);

        let received = hook.received.lock().await;
        assert_eq!(received[0]["type"], "conversation_start");
        assert_eq!(received[1]["message"], "that's all");
        assert_eq!(received[1]["user_email"], "jo@x.com");
    }
}
