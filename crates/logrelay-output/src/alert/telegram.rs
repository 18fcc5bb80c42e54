//! Telegram Bot API transport for alert messages

use async_trait::async_trait;
use logrelay_core::OutputError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Delivers rendered alert bodies to an external channel
#[async_trait]
pub trait AlertTransport: Send + Sync {
    /// Returns the name of the transport (for logging/debugging)
    fn name(&self) -> &str;

    /// Deliver one message body to `destination`
    async fn send(&self, destination: &str, body: &str) -> Result<(), OutputError>;
}

/// `sendMessage` request body
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Envelope every Bot API response is wrapped in
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// Client for the Telegram Bot API
pub struct TelegramTransport {
    client: Client,
    api_url: String,
    token: String,
}

impl TelegramTransport {
    /// Build a client without contacting the API
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self, OutputError> {
        if token.trim().is_empty() {
            return Err(OutputError::Unavailable("bot token is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OutputError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Build a client and check the token with `getMe`
    pub async fn connect(api_url: &str, token: &str, timeout: Duration) -> Result<Self, OutputError> {
        let transport = Self::new(api_url, token, timeout)?;

        let response = transport
            .client
            .get(transport.method_url("getMe"))
            .send()
            .await
            .map_err(|e| {
                OutputError::Network(format!("Failed to reach Telegram: {}", e.without_url()))
            })?;

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| {
                OutputError::Serialization(format!("Unexpected getMe response: {}", e.without_url()))
            })?;

        if !body.ok {
            return Err(OutputError::Unavailable(format!(
                "getMe rejected the bot token: {}",
                body.description.unwrap_or_default()
            )));
        }

        let username = body
            .result
            .as_ref()
            .and_then(|r| r.get("username"))
            .and_then(|u| u.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!(bot = %username, "Telegram transport authorized");

        Ok(transport)
    }

    /// Carries the token; never let it reach an error message
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }
}

#[async_trait]
impl AlertTransport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), OutputError> {
        let request = SendMessageRequest {
            chat_id: destination,
            text: body,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                OutputError::Network(format!("Failed to push to Telegram: {}", e.without_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response.text().await.unwrap_or_default();
            return Err(OutputError::Transport {
                transport: self.name().to_string(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        debug!(chat = %destination, "Delivered alert to Telegram");
        Ok(())
    }
}
