//! Conferencing message-bus gateway
//!
//! Publishes frames to client-facing channels and exposes meeting
//! lifecycle events through owned subscription handles.

use crate::errors::Result;
use crate::messages::ClientFrame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Meeting/user lifecycle events observed on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum MeetingEvent {
    /// USER_LEFT_MEETING_2x
    UserLeft {
        meeting_id: String,
        user_id: String,
    },
    /// USER_CAM_BROADCAST_STARTED_2x
    CamBroadcastStarted {
        stream_name: String,
        user_id: String,
    },
}

/// Subscription handle for meeting events. Dropping it unsubscribes.
#[derive(Debug)]
pub struct MeetingEventStream {
    rx: mpsc::UnboundedReceiver<MeetingEvent>,
}

impl MeetingEventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<MeetingEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<MeetingEvent> {
        self.rx.recv().await
    }
}

/// The bus surface the session core consumes.
#[async_trait]
pub trait BusGateway: Send + Sync {
    /// Publish a frame on the channel of one client connection.
    async fn send_to_client(&self, connection_id: &str, frame: &ClientFrame) -> Result<()>;

    /// Subscribe to meeting/user lifecycle events.
    fn meeting_events(&self) -> MeetingEventStream;
}
