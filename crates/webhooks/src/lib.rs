//! Webhook domain: endpoints, delivery records, retry policy, signing and the
//! wire payload.
//!
//! Pure logic only. HTTP and storage live in `streamhook-infra`.

pub mod delivery;
pub mod endpoint;
pub mod payload;
pub mod retry;
pub mod signing;

pub use delivery::{AttemptFailure, DeliveryStatus, WebhookDelivery, truncate_response};
pub use endpoint::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, WebhookEndpoint};
pub use payload::WebhookPayload;
pub use retry::{RetryPolicy, backoff};
pub use signing::{SigningError, sign, verify};
