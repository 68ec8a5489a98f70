//! Error type surfaced at Tide service boundaries.
//!
//! Domain layers keep their own error enums; the HTTP adapter converts
//! them into this type, which owns the status-code mapping.

use thiserror::Error;

/// Boundary error for Tide services.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Request conflicts with the resource's current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rate or capacity limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Upstream returned something unusable
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream unreachable or out of service
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::Conflict(_) => 409,
            Self::RateLimited(_) => 429,
            Self::Upstream(_) => 502,
            Self::Unavailable(_) => 503,
        }
    }
}
