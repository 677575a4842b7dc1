//! Manager configuration
//!
//! An explicit record handed to `Manager` construction. All fields are
//! read once at startup; there is no ambient/global configuration lookup.

use crate::types::MediaSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SfuConfig {
    /// Default adapter name for video publishes when the request does not
    /// name one.
    pub video_media_server: String,

    /// Baseline codec/bitrate descriptor for new sessions.
    pub media_specs: MediaSpec,

    /// Reject messages whose user-info header fails to parse. When off,
    /// such messages proceed with empty header fields.
    pub ws_strict_header_parsing: bool,

    /// How long media may stay NOT_FLOWING before the client is told.
    pub media_flow_timeout_ms: u64,

    /// How long an endpoint may stay DISCONNECTED before the client is
    /// told.
    pub media_state_timeout_ms: u64,

    /// Stop a user's sessions when the user leaves the meeting.
    pub eject_on_user_left: bool,

    /// Allow the `sendrecv` audio role.
    pub full_audio_enabled: bool,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            video_media_server: "mediasoup".to_string(),
            media_specs: MediaSpec::default(),
            ws_strict_header_parsing: false,
            media_flow_timeout_ms: 15_000,
            media_state_timeout_ms: 30_000,
            eject_on_user_left: true,
            full_audio_enabled: false,
        }
    }
}

impl SfuConfig {
    pub fn media_flow_timeout(&self) -> Duration {
        Duration::from_millis(self.media_flow_timeout_ms)
    }

    pub fn media_state_timeout(&self) -> Duration {
        Duration::from_millis(self.media_state_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_camel_case_with_defaults() {
        let cfg: SfuConfig = serde_json::from_str(
            r#"{"videoMediaServer":"kurento","mediaFlowTimeoutMs":5000}"#,
        )
        .unwrap();
        assert_eq!(cfg.video_media_server, "kurento");
        assert_eq!(cfg.media_flow_timeout(), Duration::from_millis(5000));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.media_state_timeout(), Duration::from_millis(30_000));
        assert!(!cfg.full_audio_enabled);
    }
}
