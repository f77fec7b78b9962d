//! HTTP layer: the shared client, its interceptor pipeline, and the
//! single-flight refresh coordinator.

pub mod client;
pub mod error;
pub mod refresh;

pub use client::AuthHttpClient;
pub use error::ApiError;
pub use refresh::{RefreshCoordinator, RefreshedTokens};
