//! Bus message schema
//!
//! Inbound client requests arrive as JSON keyed by `id`; outbound frames
//! are published back on the client-facing channel. Field names on the
//! wire are camelCase.

use crate::errors::{Result, SfuError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User-info header attached by the gateway in front of the bus. All
/// fields are required; anything less is a malformed header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoHeader {
    pub user_id: String,
    pub meeting_id: String,
    pub voice_bridge: String,
}

/// Outcome of parsing the optional user-info header.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderOutcome {
    Absent,
    Valid(UserInfoHeader),
    Malformed,
}

/// A raw inbound message: request id, routing handle, header outcome and
/// the undecoded payload. Typed decoding happens per request id in the
/// manager's router.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    pub connection_id: String,
    pub header: HeaderOutcome,
    payload: Value,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Envelope> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SfuError::invalid_request(format!("malformed message: {}", e)))?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SfuError::invalid_request("missing request id"))?
            .to_string();
        let connection_id = value
            .get("connectionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let header = match value.get("header") {
            None => HeaderOutcome::Absent,
            Some(h) => match serde_json::from_value::<UserInfoHeader>(h.clone()) {
                Ok(parsed) => HeaderOutcome::Valid(parsed),
                Err(_) => HeaderOutcome::Malformed,
            },
        };
        Ok(Envelope {
            id,
            connection_id,
            header,
            payload: value,
        })
    }

    /// Decode the payload into a typed request, filling empty identity
    /// fields from a valid header.
    pub fn decode<T: DeserializeOwned + WithIdentity>(&self) -> Result<T> {
        let mut req: T = serde_json::from_value(self.payload.clone())
            .map_err(|e| SfuError::invalid_request(format!("malformed {} request: {}", self.id, e)))?;
        if let HeaderOutcome::Valid(header) = &self.header {
            req.fill_from_header(header);
        }
        Ok(req)
    }
}

/// Requests carry their own identity fields; a valid user-info header
/// backfills the ones the client left empty.
pub trait WithIdentity {
    fn fill_from_header(&mut self, header: &UserInfoHeader);
}

fn fill(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

fn default_record() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub voice_bridge: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub sdp_offer: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default = "default_record")]
    pub record: bool,
    #[serde(default)]
    pub media_server: Option<String>,
}

impl WithIdentity for StartRequest {
    fn fill_from_header(&mut self, header: &UserInfoHeader) {
        fill(&mut self.user_id, &header.user_id);
        fill(&mut self.meeting_id, &header.meeting_id);
        fill(&mut self.voice_bridge, &header.voice_bridge);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberAnswerRequest {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub voice_bridge: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub answer: String,
}

impl WithIdentity for SubscriberAnswerRequest {
    fn fill_from_header(&mut self, header: &UserInfoHeader) {
        fill(&mut self.user_id, &header.user_id);
        fill(&mut self.meeting_id, &header.meeting_id);
        fill(&mut self.voice_bridge, &header.voice_bridge);
    }
}

/// Identity-only request shape shared by `stop`, `restartIce` and `error`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRequest {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub voice_bridge: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub camera_id: Option<String>,
}

impl WithIdentity for IdentityRequest {
    fn fill_from_header(&mut self, header: &UserInfoHeader) {
        fill(&mut self.user_id, &header.user_id);
        fill(&mut self.meeting_id, &header.meeting_id);
        fill(&mut self.voice_bridge, &header.voice_bridge);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub voice_bridge: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub candidate: Value,
}

impl WithIdentity for IceCandidateRequest {
    fn fill_from_header(&mut self, header: &UserInfoHeader) {
        fill(&mut self.user_id, &header.user_id);
        fill(&mut self.meeting_id, &header.meeting_id);
        fill(&mut self.voice_bridge, &header.voice_bridge);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtmfRequest {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub meeting_id: String,
    #[serde(default)]
    pub voice_bridge: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub tones: String,
}

impl WithIdentity for DtmfRequest {
    fn fill_from_header(&mut self, header: &UserInfoHeader) {
        fill(&mut self.user_id, &header.user_id);
        fill(&mut self.meeting_id, &header.meeting_id);
        fill(&mut self.voice_bridge, &header.voice_bridge);
    }
}

/// Error payload of an outbound error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub reason: String,
}

/// Frames published on the client-facing channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id")]
pub enum ClientFrame {
    #[serde(rename = "startResponse", rename_all = "camelCase")]
    StartResponse {
        #[serde(rename = "type")]
        media_type: String,
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        caller_id: Option<String>,
        sdp_answer: String,
    },

    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    IceCandidate {
        #[serde(rename = "type")]
        media_type: String,
        candidate: Value,
    },

    #[serde(rename = "webRTCAudioSuccess", rename_all = "camelCase")]
    WebRtcAudioSuccess { success: String },

    #[serde(rename = "webRTCAudioError", rename_all = "camelCase")]
    WebRtcAudioError {
        #[serde(rename = "type")]
        media_type: String,
        error: ErrorBody,
    },

    #[serde(rename = "videoError", rename_all = "camelCase")]
    VideoError {
        #[serde(rename = "type")]
        media_type: String,
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_id: Option<String>,
        error: ErrorBody,
    },

    #[serde(rename = "close", rename_all = "camelCase")]
    Close {
        #[serde(rename = "type")]
        media_type: String,
    },

    #[serde(rename = "restartIceResponse", rename_all = "camelCase")]
    RestartIceResponse {
        #[serde(rename = "type")]
        media_type: String,
        sdp: String,
    },

    #[serde(rename = "dtmfResponse", rename_all = "camelCase")]
    DtmfResponse {
        #[serde(rename = "type")]
        media_type: String,
        digits: String,
    },
}

impl ClientFrame {
    /// The MEDIA_FLOWING success notification (audio channels only).
    pub fn media_flowing() -> ClientFrame {
        ClientFrame::WebRtcAudioSuccess {
            success: "MEDIA_FLOWING".to_string(),
        }
    }

    /// Build the error frame matching the channel's media type.
    pub fn error(
        media_type: crate::types::MediaType,
        role: Option<crate::types::Role>,
        camera_id: Option<String>,
        code: u32,
        reason: &str,
    ) -> ClientFrame {
        let body = ErrorBody {
            code,
            reason: reason.to_string(),
        };
        match media_type {
            crate::types::MediaType::Audio => ClientFrame::WebRtcAudioError {
                media_type: media_type.as_str().to_string(),
                error: body,
            },
            crate::types::MediaType::Video => ClientFrame::VideoError {
                media_type: media_type.as_str().to_string(),
                role: role.map(|r| r.as_str().to_string()).unwrap_or_default(),
                camera_id,
                error: body,
            },
        }
    }

    /// Error body carried by this frame, if it is an error frame.
    pub fn error_body(&self) -> Option<&ErrorBody> {
        match self {
            ClientFrame::WebRtcAudioError { error, .. } => Some(error),
            ClientFrame::VideoError { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_parses_id_connection_and_header() {
        let raw = r#"{
            "id": "start",
            "connectionId": "conn-1",
            "header": {"userId": "u1", "meetingId": "m1", "voiceBridge": "72013"},
            "role": "share",
            "cameraId": "c1",
            "sdpOffer": "O"
        }"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.id, "start");
        assert_eq!(envelope.connection_id, "conn-1");
        let req: StartRequest = envelope.decode().unwrap();
        // Header backfills what the payload left empty.
        assert_eq!(req.user_id, "u1");
        assert_eq!(req.meeting_id, "m1");
        assert_eq!(req.voice_bridge, "72013");
        assert_eq!(req.camera_id.as_deref(), Some("c1"));
        assert_eq!(req.sdp_offer.as_deref(), Some("O"));
        assert!(req.record);
    }

    #[test]
    fn payload_identity_wins_over_header() {
        let raw = r#"{
            "id": "stop",
            "connectionId": "conn-1",
            "userId": "payload-user",
            "header": {"userId": "header-user", "meetingId": "m1", "voiceBridge": "72013"},
            "role": "share"
        }"#;
        let req: IdentityRequest = Envelope::parse(raw).unwrap().decode().unwrap();
        assert_eq!(req.user_id, "payload-user");
        assert_eq!(req.meeting_id, "m1");
    }

    #[test]
    fn malformed_header_is_flagged_not_fatal() {
        let raw = r#"{"id": "start", "connectionId": "c", "header": {"userId": 42}}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.header, HeaderOutcome::Malformed);
        // The payload itself still decodes.
        let req: StartRequest = envelope.decode().unwrap();
        assert_eq!(req.user_id, "");
    }

    #[test]
    fn missing_id_is_an_invalid_request() {
        assert!(Envelope::parse(r#"{"connectionId": "c"}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn frames_serialize_with_wire_names() {
        let frame = ClientFrame::StartResponse {
            media_type: "video".into(),
            role: "share".into(),
            camera_id: Some("c1".into()),
            caller_id: None,
            sdp_answer: "A".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], "startResponse");
        assert_eq!(json["type"], "video");
        assert_eq!(json["cameraId"], "c1");
        assert_eq!(json["sdpAnswer"], "A");
        assert!(json.get("callerId").is_none());

        let frame = ClientFrame::error(
            crate::types::MediaType::Audio,
            None,
            None,
            2211,
            "MEDIA_TIMEOUT",
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], "webRTCAudioError");
        assert_eq!(json["error"]["code"], 2211);
        assert_eq!(json["error"]["reason"], "MEDIA_TIMEOUT");
    }
}
