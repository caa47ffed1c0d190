//! HTTP clients for the external WhatsApp and email gateway services.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::domain::retry::{is_retryable_status, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("gateway rejected message: {0}")]
    Rejected(String),
}

impl GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Status { status, .. } => is_retryable_status(*status),
            GatewayError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// E.164 phone for WhatsApp, address for email.
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait MessageGateway: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &OutboundMessage) -> Result<(), GatewayError>;
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    success: Option<bool>,
    error: Option<String>,
}

async fn post_with_retry<B: Serialize + Sync>(
    client: &Client,
    gateway: &'static str,
    url: &str,
    body: &B,
    policy: RetryPolicy,
) -> Result<(), GatewayError> {
    let mut attempt = 1;
    loop {
        match post_once(client, url, body).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(gateway, attempt, ?delay, error = %e, "gateway call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(gateway, attempt, error = %e, "gateway call failed");
                return Err(e);
            }
        }
    }
}

async fn post_once<B: Serialize + Sync>(client: &Client, url: &str, body: &B) -> Result<(), GatewayError> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

    if !status.is_success() {
        return Err(GatewayError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    // Gateways answer { success, error }; a non-JSON 2xx counts as delivered.
    if let Ok(reply) = serde_json::from_str::<GatewayReply>(&text) {
        if reply.success == Some(false) {
            return Err(GatewayError::Rejected(
                reply.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
    }
    Ok(())
}

pub struct WhatsAppGateway {
    client: Client,
    url: String,
    policy: RetryPolicy,
}

impl WhatsAppGateway {
    pub fn new(client: Client, base_url: &str, policy: RetryPolicy) -> Self {
        Self {
            client,
            url: format!("{}/whatsapp/appointment-confirmation", base_url.trim_end_matches('/')),
            policy,
        }
    }
}

#[derive(Serialize)]
struct WhatsAppBody<'a> {
    phone: &'a str,
    message: &'a str,
}

#[async_trait]
impl MessageGateway for WhatsAppGateway {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), GatewayError> {
        let body = WhatsAppBody {
            phone: message.to.trim_start_matches('+'),
            message: &message.body,
        };
        post_with_retry(&self.client, self.name(), &self.url, &body, self.policy).await
    }
}

pub struct EmailGateway {
    client: Client,
    url: String,
    policy: RetryPolicy,
}

impl EmailGateway {
    pub fn new(client: Client, base_url: &str, policy: RetryPolicy) -> Self {
        Self {
            client,
            url: format!("{}/email/send", base_url.trim_end_matches('/')),
            policy,
        }
    }
}

#[derive(Serialize)]
struct EmailBody<'a> {
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[async_trait]
impl MessageGateway for EmailGateway {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), GatewayError> {
        let body = EmailBody {
            to: &message.to,
            subject: message.subject.as_deref().unwrap_or("Notificación"),
            html: &message.body,
        };
        post_with_retry(&self.client, self.name(), &self.url, &body, self.policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn whatsapp_message() -> OutboundMessage {
        OutboundMessage {
            to: "+573001234567".into(),
            subject: None,
            body: "Hola".into(),
        }
    }

    #[tokio::test]
    async fn whatsapp_posts_phone_without_plus() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/whatsapp/appointment-confirmation")
                .json_body(serde_json::json!({ "phone": "573001234567", "message": "Hola" }));
            then.status(200).json_body(serde_json::json!({ "success": true }));
        });

        let gw = WhatsAppGateway::new(Client::new(), &server.base_url(), policy(3));
        gw.send(&whatsapp_message()).await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_attempts_run_out() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/email/send");
            then.status(503).body("busy");
        });

        let gw = EmailGateway::new(Client::new(), &server.base_url(), policy(3));
        let msg = OutboundMessage {
            to: "ana@empresa.co".into(),
            subject: Some("Cita".into()),
            body: "<p>Hola</p>".into(),
        };
        let err = gw.send(&msg).await.unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 503, .. }));
        mock.assert_hits(3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/whatsapp/appointment-confirmation");
            then.status(400).body("bad phone");
        });

        let gw = WhatsAppGateway::new(Client::new(), &server.base_url(), policy(3));
        let err = gw.send(&whatsapp_message()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 400, .. }));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn success_false_reply_is_a_rejection() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/whatsapp/appointment-confirmation");
            then.status(200)
                .json_body(serde_json::json!({ "success": false, "error": "client not ready" }));
        });

        let gw = WhatsAppGateway::new(Client::new(), &server.base_url(), policy(3));
        let err = gw.send(&whatsapp_message()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(ref m) if m == "client not ready"));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_transport_error() {
        let gw = WhatsAppGateway::new(Client::new(), "http://127.0.0.1:9", policy(2));
        let err = gw.send(&whatsapp_message()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}
