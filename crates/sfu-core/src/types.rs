//! Core identity and negotiation types
//!
//! The composite session key and its string form are the primary key for
//! the session table, the lifecycle queues and the pending-ICE queues.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type a manager instance is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session role. `share`/`sendrecv` publish media towards the SFU,
/// `viewer`/`recvonly` only receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Share,
    Viewer,
    SendRecv,
    RecvOnly,
}

impl Role {
    /// Parse a wire role string against the media type it arrived on.
    /// Video accepts `share`/`viewer`, audio accepts `sendrecv`/`recvonly`.
    pub fn parse(media_type: MediaType, raw: &str) -> Option<Role> {
        match (media_type, raw) {
            (MediaType::Video, "share") => Some(Role::Share),
            (MediaType::Video, "viewer") => Some(Role::Viewer),
            (MediaType::Audio, "sendrecv") => Some(Role::SendRecv),
            (MediaType::Audio, "recvonly") => Some(Role::RecvOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Share => "share",
            Role::Viewer => "viewer",
            Role::SendRecv => "sendrecv",
            Role::RecvOnly => "recvonly",
        }
    }

    /// Publisher roles own a media id on the MCS and go through the
    /// broadcast authorization path.
    pub fn is_publisher(&self) -> bool {
        matches!(self, Role::Share | Role::SendRecv)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite session key: `(userId, resourceId, role)`.
///
/// `resource_id` is a camera id for video and the voice bridge for audio.
/// The canonical string form `"<userId>-<resourceId>-<role>"` keys the
/// session table and all queue lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub resource_id: String,
    pub role: Role,
}

impl SessionKey {
    pub fn new(
        user_id: impl Into<String>,
        resource_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            resource_id: resource_id.into(),
            role,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.user_id, self.resource_id, self.role)
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl SessionStatus {
    /// A session is ready while it is starting or started.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Started)
    }
}

/// Negotiated bandwidth/codec descriptor carried through publish and
/// subscribe options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSpec {
    pub codec: String,
    /// Target bitrate in kbps.
    pub bitrate: u32,
}

impl Default for MediaSpec {
    fn default() -> Self {
        Self {
            codec: "VP8".to_string(),
            bitrate: 300,
        }
    }
}

impl MediaSpec {
    /// Apply a client-requested bitrate, never exceeding the configured one.
    pub fn with_requested_bitrate(&self, requested: Option<u32>) -> Self {
        let bitrate = match requested {
            Some(r) if r > 0 => r.min(self.bitrate),
            _ => self.bitrate,
        };
        Self {
            codec: self.codec.clone(),
            bitrate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_scoped_to_media_type() {
        assert_eq!(Role::parse(MediaType::Video, "share"), Some(Role::Share));
        assert_eq!(Role::parse(MediaType::Video, "viewer"), Some(Role::Viewer));
        assert_eq!(Role::parse(MediaType::Audio, "sendrecv"), Some(Role::SendRecv));
        assert_eq!(Role::parse(MediaType::Audio, "recvonly"), Some(Role::RecvOnly));
        // Roles from the other media type are invalid requests.
        assert_eq!(Role::parse(MediaType::Audio, "share"), None);
        assert_eq!(Role::parse(MediaType::Video, "sendrecv"), None);
        assert_eq!(Role::parse(MediaType::Video, "moderator"), None);
    }

    #[test]
    fn session_key_canonical_form() {
        let key = SessionKey::new("u1", "c1", Role::Share);
        assert_eq!(key.to_string(), "u1-c1-share");

        let key = SessionKey::new("u2", "72013", Role::RecvOnly);
        assert_eq!(key.to_string(), "u2-72013-recvonly");
    }

    #[test]
    fn readiness_covers_starting_and_started_only() {
        assert!(SessionStatus::Starting.is_ready());
        assert!(SessionStatus::Started.is_ready());
        assert!(!SessionStatus::Stopping.is_ready());
        assert!(!SessionStatus::Stopped.is_ready());
    }

    #[test]
    fn requested_bitrate_is_clamped() {
        let spec = MediaSpec {
            codec: "VP8".into(),
            bitrate: 300,
        };
        assert_eq!(spec.with_requested_bitrate(Some(200)).bitrate, 200);
        assert_eq!(spec.with_requested_bitrate(Some(500)).bitrate, 300);
        assert_eq!(spec.with_requested_bitrate(Some(0)).bitrate, 300);
        assert_eq!(spec.with_requested_bitrate(None).bitrate, 300);
    }
}
