//! Media Control Server gateway
//!
//! Typed facade over the MCS RPC surface. Events are consumed through
//! owned subscription handles; dropping a handle is the unsubscribe.

use crate::errors::Result;
use crate::types::{MediaSpec, MediaType};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Options for joining an MCS room.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub external_user_id: String,
    pub auto_leave: bool,
}

/// Options for publishing a WebRTC media into a room.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sdp_offer: Option<String>,
    /// Target adapter name in the MCS.
    pub adapter: String,
    pub media_specs: Option<MediaSpec>,
    pub rtp_header_extensions: Vec<String>,
    pub override_router_codecs: bool,
    pub dedicated_router: bool,
    pub record: bool,
    /// Resolved source stream name, when the camera maps to an external
    /// (SIP-dialed) source.
    pub stream_name: Option<String>,
}

/// Options for subscribing to an existing media.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub sdp_offer: Option<String>,
    pub adapter: String,
    pub media_specs: Option<MediaSpec>,
}

/// Result of a publish or subscribe negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedMedia {
    pub media_id: String,
    pub sdp_answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    In,
    Out,
}

/// Media-scoped events delivered on a `MediaEventStream`.
#[derive(Debug, Clone, PartialEq)]
pub enum McsEvent {
    /// MEDIA_STATE: ICE/DTLS connectivity of the endpoint.
    MediaState { connected: bool },
    /// Media flow observation in either direction.
    MediaFlow {
        direction: FlowDirection,
        flowing: bool,
    },
    /// MEDIA_STATE_ICE: a server-side candidate to trickle to the client.
    IceCandidate { candidate: Value },
    /// The media server declared this endpoint dead.
    ServerOffline,
}

/// Subscription handle for the events of a single media id.
#[derive(Debug)]
pub struct MediaEventStream {
    rx: mpsc::UnboundedReceiver<McsEvent>,
}

impl MediaEventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<McsEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<McsEvent> {
        self.rx.recv().await
    }
}

/// Subscription handle for the process-level MCS_DISCONNECTED event.
#[derive(Debug)]
pub struct DisconnectStream {
    rx: mpsc::UnboundedReceiver<()>,
}

impl DisconnectStream {
    pub fn new(rx: mpsc::UnboundedReceiver<()>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// The MCS RPC surface the session core consumes.
///
/// Implementations map transport failures to `NegotiationFailed`; an
/// unreachable server is reported through `wait_for_connection`.
#[async_trait]
pub trait McsGateway: Send + Sync {
    /// True when the MCS connection is up.
    async fn wait_for_connection(&self) -> bool;

    /// Join a room, returning the MCS-side user id.
    async fn join(&self, room: &str, kind: &str, opts: JoinOptions) -> Result<String>;

    /// Publish a WebRTC media, returning its media id and SDP answer.
    async fn publish(
        &self,
        mcs_user_id: &str,
        room: &str,
        media_type: MediaType,
        opts: PublishOptions,
    ) -> Result<NegotiatedMedia>;

    /// Subscribe to an existing media, returning the subscriber media id
    /// and descriptor.
    async fn subscribe(
        &self,
        mcs_user_id: &str,
        source_media_id: &str,
        media_type: MediaType,
        opts: SubscribeOptions,
    ) -> Result<NegotiatedMedia>;

    /// Consume a source media into a sink, returning the sink descriptor.
    async fn consume(
        &self,
        source_media_id: &str,
        sink_media_id: &str,
        media_type: MediaType,
    ) -> Result<String>;

    /// Connect one media to another in a single direction.
    async fn connect(
        &self,
        source_media_id: &str,
        sink_media_id: &str,
        media_type: MediaType,
    ) -> Result<()>;

    async fn add_ice_candidate(&self, media_id: &str, candidate: &Value) -> Result<()>;

    /// Deliver the remote peer's answer for a negotiated media.
    async fn process_answer(&self, media_id: &str, answer: &str) -> Result<()>;

    async fn unpublish(&self, mcs_user_id: &str, media_id: &str) -> Result<()>;

    /// Restart ICE for a media, returning the fresh offer descriptor.
    async fn restart_ice(&self, media_id: &str) -> Result<String>;

    /// Send DTMF tones through a media, returning the accepted digits.
    async fn dtmf(&self, media_id: &str, tones: &str) -> Result<String>;

    /// Subscribe to MEDIA_STATE / MEDIA_STATE_ICE events of one media id.
    fn media_events(&self, media_id: &str) -> MediaEventStream;

    /// Subscribe to the process-level MCS_DISCONNECTED event.
    fn disconnect_events(&self) -> DisconnectStream;
}
