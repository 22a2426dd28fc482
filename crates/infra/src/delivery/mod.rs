//! Outbound webhook delivery: HTTP client plus the attempt/record cycle.

pub mod client;
pub mod engine;
pub mod error;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use engine::{
    AttemptOutcome, DEFAULT_LEASE_MARGIN, DEFAULT_MAX_ATTEMPT_TIMEOUT, DeliveryEngine,
    DeliveryReport, EngineConfig,
};
pub use error::DeliveryError;
