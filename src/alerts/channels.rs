//! Per-channel message rendering and HTTP delivery

use crate::config::{ChannelConfig, ChannelKind, MessageFormat};
use crate::error::AlertError;
use crate::events::{AlertEvent, Severity};
use log::debug;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// A rendered message ready to be posted
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: &'static str,
    pub url: String,
    pub payload: Value,
}

fn severity_label(severity: Severity) -> String {
    severity.to_string().to_uppercase()
}

fn slack_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "#36a64f",
        Severity::Warning => "#ff9f00",
        Severity::Error => "#d00000",
    }
}

fn discord_color(severity: Severity) -> u32 {
    match severity {
        Severity::Info => 0x36a64f,
        Severity::Warning => 0xff9f00,
        Severity::Error => 0xd00000,
    }
}

/// `[Caddy Alert - WARNING] [2024-01-01 00:00:00 UTC] message`
pub fn plain_text(event: &AlertEvent) -> String {
    format!(
        "[Caddy Alert - {}] [{}] {}",
        severity_label(event.severity),
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        event.message
    )
}

/// Escape text for Telegram's HTML parse mode
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// HTML body for Telegram
///
/// Telegram rejects a message whose markup it cannot parse, so every event field is escaped
/// and only the fixed labels carry tags.
pub fn telegram_html(event: &AlertEvent) -> String {
    format!(
        "<b>Caddy Alert - {}</b>\n<b>Time:</b> {}\n<b>Source:</b> <code>{}</code>\n\n{}",
        severity_label(event.severity),
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        escape_html(&event.source),
        escape_html(&event.message)
    )
}

/// Markdown body used by markdown-mode webhooks
pub fn markdown_text(event: &AlertEvent) -> String {
    format!(
        "*Caddy Alert - {}*\n*Time:* {}\n*Source:* `{}`\n\n{}",
        severity_label(event.severity),
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        event.source,
        event.message
    )
}

/// Render `event` for `channel` in the channel's effective format
///
/// Webhooks get `{"text": ...}`, Slack an attachment, Discord an embed and Telegram a
/// `sendMessage` call against the bot API. Text format strips every channel down to its
/// plain-text field.
///
/// # Arguments
///
/// * `channel` - Endpoint configuration; for Telegram `url` holds the bot token
/// * `event` - The alert to render
///
/// # Returns
///
/// The URL to post to and the JSON payload, tagged with the channel name
pub fn render(channel: &ChannelConfig, event: &AlertEvent) -> OutboundMessage {
    let markdown = channel.effective_format() == MessageFormat::Markdown;
    let text = plain_text(event);
    let payload = match (channel.kind, markdown) {
        (ChannelKind::Webhook, false) => json!({ "text": text }),
        (ChannelKind::Webhook, true) => json!({ "text": markdown_text(event) }),
        (ChannelKind::Slack, false) => json!({ "text": text }),
        (ChannelKind::Slack, true) => json!({
            "text": text,
            "attachments": [{
                "color": slack_color(event.severity),
                "title": format!("Caddy Alert - {}", severity_label(event.severity)),
                "text": event.message,
                "mrkdwn_in": ["text"],
                "fields": [
                    { "title": "Severity", "value": event.severity.to_string(), "short": true },
                    { "title": "Metric", "value": event.source_metric, "short": true },
                    { "title": "Source", "value": event.source, "short": true },
                ],
                "ts": event.timestamp.timestamp(),
            }]
        }),
        (ChannelKind::Discord, false) => json!({ "content": text }),
        (ChannelKind::Discord, true) => json!({
            "content": text,
            "embeds": [{
                "title": format!("Caddy Alert - {}", severity_label(event.severity)),
                "description": event.message,
                "color": discord_color(event.severity),
                "timestamp": event.timestamp.to_rfc3339(),
                "fields": [
                    { "name": "Severity", "value": event.severity.to_string(), "inline": true },
                    { "name": "Metric", "value": event.source_metric, "inline": true },
                    { "name": "Source", "value": event.source, "inline": true },
                ],
            }]
        }),
        (ChannelKind::Telegram, false) => json!({
            "chat_id": channel.chat_id,
            "text": text,
        }),
        (ChannelKind::Telegram, true) => json!({
            "chat_id": channel.chat_id,
            "text": telegram_html(event),
            "parse_mode": "HTML",
        }),
    };

    let url = match channel.kind {
        ChannelKind::Telegram => format!("{}/bot{}/sendMessage", TELEGRAM_API, channel.url),
        _ => channel.url.clone(),
    };
    OutboundMessage {
        channel: channel.name(),
        url,
        payload,
    }
}

/// Delivers rendered messages
pub trait NotificationTransport: Send + Sync {
    /// Post `message` once; retries are the caller's concern
    ///
    /// # Returns
    ///
    /// `Ok(())` when the endpoint accepted the message, `Err(AlertError)` on a transport
    /// error or a non-success status
    fn post<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>>;
}

/// JSON-over-HTTP delivery
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// # Arguments
    ///
    /// * `timeout` - Per-request timeout for every post
    ///
    /// # Errors
    ///
    /// Returns `AlertError` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl NotificationTransport for HttpTransport {
    fn post<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&message.url)
                .json(&message.payload)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                debug!("{} accepted the alert", message.channel);
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(AlertError::HttpStatus {
                    channel: message.channel.to_string(),
                    status: status.as_u16(),
                    body,
                })
            }
        })
    }
}
