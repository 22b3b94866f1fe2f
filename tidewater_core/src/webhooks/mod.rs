//! Webhook Delivery Queue: signed completion/failure callbacks with retry backoff.
//!
//! Refresh paths only `notify`; delivery happens when the queue is drained.

pub mod models;
pub mod queue;
pub mod sender;
pub mod signing;
pub mod traits;

pub use models::{
    DeliveryStatus, EVENT_REFRESH_COMPLETED, EVENT_REFRESH_FAILED, EVENT_WILDCARD, RetryConfig,
    WebhookConfig, WebhookDelivery,
};
pub use queue::{DrainReport, WebhookQueue};
pub use sender::HttpWebhookSender;
pub use signing::{sign_body, verify_signature};
pub use traits::{OutboundRequest, TransportResponse, WebhookStore, WebhookTransport};
