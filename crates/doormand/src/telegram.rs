//! Telegram Bot API transport: outbound alerts and the inbound update listener.

use crate::context;
use crate::notifier::{
    ActionButton, DecisionPayload, InboundEvent, MessageRef, Notifier, TransportError,
};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BUTTONS_PER_ROW: usize = 2;
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

pub const WELCOME_TEXT: &str =
    "Welcome to Door Security Bot! I will notify you when someone is at the door.";

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("event receiver closed")]
    Closed,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    message: Option<Message>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Serialize)]
struct InlineButton<'a> {
    text: &'a str,
    callback_data: &'a str,
}

#[derive(Serialize)]
struct InlineKeyboard<'a> {
    inline_keyboard: Vec<Vec<InlineButton<'a>>>,
}

/// Bot API client bound to one operator chat.
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    chat_id: i64,
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("base_url", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(api_url: &str, token: &str, chat_id: i64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Permanent(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{token}", api_url.trim_end_matches('/')),
            chat_id,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    /// Connectivity and credential probe.
    pub async fn get_me(&self) -> Result<BotUser, TransportError> {
        self.call(self.client.get(self.url("getMe"))).await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.url("sendMessage"))
            .json(&json!({ "chat_id": chat_id, "text": text }));
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }

    async fn answer_callback(&self, query_id: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.url("answerCallbackQuery"))
            .json(&json!({ "callback_query_id": query_id }));
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let mut body = json!({
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        let request = self
            .client
            .post(self.url("getUpdates"))
            .timeout(timeout + REQUEST_TIMEOUT)
            .json(&body);
        self.call(request).await
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        let body: ApiResponse<T> = response.json().await.map_err(|e| {
            if status.is_success() {
                let e = e.without_url();
                TransportError::Permanent(format!("malformed Bot API response: {e}"))
            } else {
                classify_status(status, format!("HTTP {status}"))
            }
        })?;

        match body {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                description,
                error_code,
                ..
            } => {
                let status = error_code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(status);
                let description = description.unwrap_or_else(|| "no description".into());
                Err(classify_status(status, format!("{status}: {description}")))
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_photo(
        &self,
        image: Vec<u8>,
        caption: &str,
        actions: &[ActionButton],
    ) -> Result<MessageRef, TransportError> {
        let markup = serde_json::to_string(&keyboard(actions))
            .map_err(|e| TransportError::Permanent(format!("failed to encode keyboard: {e}")))?;
        let photo = Part::bytes(image)
            .file_name("face.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| TransportError::Permanent(e.to_string()))?;
        let form = Form::new()
            .text("chat_id", self.chat_id.to_string())
            .text("caption", caption.to_string())
            .text("reply_markup", markup)
            .part("photo", photo);

        let request = self.client.post(self.url("sendPhoto")).multipart(form);
        let message: Message = self.call(request).await?;
        Ok(MessageRef {
            chat_id: message.chat.id,
            message_id: message.message_id,
        })
    }

    async fn edit_caption(&self, message: &MessageRef, text: &str) -> Result<(), TransportError> {
        let request = self
            .client
            .post(self.url("editMessageCaption"))
            .json(&json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "caption": text,
            }));
        self.call::<serde_json::Value>(request).await.map(|_| ())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send_message(self.chat_id, text).await
    }
}

fn keyboard(actions: &[ActionButton]) -> InlineKeyboard<'_> {
    InlineKeyboard {
        inline_keyboard: actions
            .chunks(BUTTONS_PER_ROW)
            .map(|row| {
                row.iter()
                    .map(|a| InlineButton {
                        text: &a.label,
                        callback_data: &a.payload,
                    })
                    .collect()
            })
            .collect(),
    }
}

/// The request URL embeds the bot token, so it never reaches the error text.
fn classify_request_error(error: reqwest::Error) -> TransportError {
    let transient = error.is_timeout() || error.is_connect() || error.is_request();
    let message = error.without_url().to_string();
    if transient {
        TransportError::Transient(message)
    } else {
        TransportError::Permanent(message)
    }
}

fn classify_status(status: StatusCode, message: String) -> TransportError {
    if matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) {
        TransportError::Transient(message)
    } else {
        TransportError::Permanent(message)
    }
}

/// Turn one update into an inbound event, if it carries an operator action.
fn parse_callback(query: &CallbackQuery) -> Option<InboundEvent> {
    let message = query.message.as_ref()?;
    let origin = MessageRef {
        chat_id: message.chat.id,
        message_id: message.message_id,
    };
    let raw = query.data.clone().unwrap_or_default();
    Some(match raw.parse::<DecisionPayload>() {
        Ok(payload) => InboundEvent::Decision { payload, origin },
        Err(_) => InboundEvent::Malformed { raw, origin },
    })
}

fn is_start_command(message: &Message) -> bool {
    message
        .text
        .as_deref()
        .and_then(|t| t.split_whitespace().next())
        .is_some_and(|cmd| cmd == "/start" || cmd.starts_with("/start@"))
}

/// Long-polls `getUpdates` and forwards operator actions.
pub struct Listener {
    api: Arc<TelegramNotifier>,
    events: mpsc::Sender<InboundEvent>,
    shutdown: watch::Receiver<bool>,
    poll_timeout: Duration,
}

impl Listener {
    pub fn new(
        api: Arc<TelegramNotifier>,
        events: mpsc::Sender<InboundEvent>,
        shutdown: watch::Receiver<bool>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            api,
            events,
            shutdown,
            poll_timeout,
        }
    }

    /// Poll until shutdown. Network failures back off exponentially and
    /// never end the loop.
    pub async fn run(self) -> Result<(), ListenerError> {
        let Listener {
            api,
            events,
            mut shutdown,
            poll_timeout,
        } = self;

        let mut reconnect = ExponentialBackoff {
            initial_interval: RECONNECT_INITIAL,
            max_interval: RECONNECT_MAX,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut offset: Option<i64> = None;
        let mut backlog_skipped = false;

        tracing::info!("operator listener started");
        loop {
            // Stale button presses from before startup are discarded.
            if !backlog_skipped {
                let skipped = tokio::select! {
                    _ = context::stopped(&mut shutdown) => break,
                    r = api.get_updates(Some(-1), Duration::ZERO) => r,
                };
                match skipped {
                    Ok(updates) => {
                        offset = updates.last().map(|u| u.update_id + 1);
                        backlog_skipped = true;
                        reconnect.reset();
                    }
                    Err(e) => {
                        if !wait_reconnect(&mut reconnect, &mut shutdown, &e).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let polled = tokio::select! {
                _ = context::stopped(&mut shutdown) => break,
                r = api.get_updates(offset, poll_timeout) => r,
            };
            let updates = match polled {
                Ok(updates) => {
                    reconnect.reset();
                    updates
                }
                Err(e) => {
                    if !wait_reconnect(&mut reconnect, &mut shutdown, &e).await {
                        break;
                    }
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                if let Some(query) = update.callback_query {
                    if let Err(e) = api.answer_callback(&query.id).await {
                        tracing::debug!(error = %e, "failed to acknowledge callback");
                    }
                    match parse_callback(&query) {
                        Some(event) => {
                            events.send(event).await.map_err(|_| ListenerError::Closed)?;
                        }
                        None => tracing::error!("callback query without message"),
                    }
                } else if let Some(message) = update.message {
                    if is_start_command(&message) {
                        if let Err(e) = api.send_message(message.chat.id, WELCOME_TEXT).await {
                            tracing::warn!(error = %e, "failed to answer /start");
                        }
                    }
                }
            }
        }
        tracing::info!("operator listener stopped");
        Ok(())
    }
}

/// Sleep for the next backoff interval. Returns `false` on shutdown.
async fn wait_reconnect(
    reconnect: &mut ExponentialBackoff,
    shutdown: &mut watch::Receiver<bool>,
    error: &TransportError,
) -> bool {
    let delay = reconnect.next_backoff().unwrap_or(RECONNECT_MAX);
    tracing::warn!(
        error = %error,
        retry_in_ms = delay.as_millis() as u64,
        "update polling failed"
    );
    tokio::select! {
        _ = context::stopped(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
