//! Session management: credential storage and the session facade.
//!
//! This module provides:
//! - `TokenStore`: the access/refresh pair with an optional persistent mirror
//! - `SessionService`: login/logout, the startup probe, and the shared client

pub mod session;
pub mod tokens;

pub use session::{SessionEvent, SessionService, SessionState};
pub use tokens::{TokenPair, TokenStore};
