use crate::webhooks::traits::{OutboundRequest, TransportResponse, WebhookTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tidewater-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Webhook(format!("build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookSender {
    #[tracing::instrument(level = "debug", skip_all, fields(url = %request.url))]
    async fn deliver(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let mut req = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (k, v) in &request.headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Webhook(format!("timed out after {}ms", request.timeout.as_millis()))
            } else {
                Error::Webhook(format!("request failed: {e}"))
            }
        })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}
