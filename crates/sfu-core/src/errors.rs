//! Error types and the client-facing error catalogue
//!
//! Every failure surfaced to a client is normalized to a fixed
//! `(code, reason)` pair; raw internal error text never crosses the bus.

use thiserror::Error;

/// Numeric code for a failed negotiation or an MCS RPC failure mid-start.
pub const NEGOTIATION_FAILED_CODE: u32 = 2200;
/// Numeric code for an unreachable or lost media control server.
pub const MEDIA_SERVER_OFFLINE_CODE: u32 = 2201;
/// Numeric code for a malformed, unknown or disallowed request.
pub const INVALID_REQUEST_CODE: u32 = 2202;
/// Numeric code for a permission denial from the oracle.
pub const PERMISSION_DENIED_CODE: u32 = 2208;
/// Numeric code for a fired media-flow or media-state watchdog.
pub const MEDIA_TIMEOUT_CODE: u32 = 2211;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media server offline")]
    MediaServerOffline,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Bridge operation failed: {0}")]
    BridgeFailed(String),

    #[error("Media timeout")]
    MediaTimeout,
}

impl SfuError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        SfuError::InvalidRequest(msg.into())
    }

    pub fn negotiation_failed(msg: impl Into<String>) -> Self {
        SfuError::NegotiationFailed(msg.into())
    }

    pub fn bridge_failed(msg: impl Into<String>) -> Self {
        SfuError::BridgeFailed(msg.into())
    }

    /// Catalogue code sent to the client.
    pub fn error_code(&self) -> u32 {
        match self {
            SfuError::InvalidRequest(_) => INVALID_REQUEST_CODE,
            SfuError::MediaServerOffline => MEDIA_SERVER_OFFLINE_CODE,
            SfuError::PermissionDenied => PERMISSION_DENIED_CODE,
            // Bridge faults are negotiation faults as far as the client
            // is concerned.
            SfuError::NegotiationFailed(_) | SfuError::BridgeFailed(_) => {
                NEGOTIATION_FAILED_CODE
            }
            SfuError::MediaTimeout => MEDIA_TIMEOUT_CODE,
        }
    }

    /// Catalogue reason sent to the client.
    pub fn client_reason(&self) -> &'static str {
        match self {
            SfuError::InvalidRequest(_) => "SFU_INVALID_REQUEST",
            SfuError::MediaServerOffline => "MEDIA_SERVER_OFFLINE",
            SfuError::PermissionDenied => "SFU_UNAUTHORIZED",
            SfuError::NegotiationFailed(_) | SfuError::BridgeFailed(_) => {
                "NEGOTIATION_FAILED"
            }
            SfuError::MediaTimeout => "MEDIA_TIMEOUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
