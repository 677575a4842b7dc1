//! Media endpoints
//!
//! The SFU-side abstraction of a single client's media session, in two
//! variants behind one closed capability set: publishers own a media id
//! and (for audio) a private softswitch bridge; consumers attach to the
//! meeting's shared bridge. Capabilities a variant lacks return their
//! documented defaults instead of being probed dynamically.

mod consumer;
mod publisher;

pub use consumer::ConsumerEndpoint;
pub use publisher::PublisherEndpoint;

use crate::bridge::BridgeRegistry;
use crate::bus::BusGateway;
use crate::errors::Result;
use crate::mcs::{McsEvent, McsGateway, MediaEventStream};
use crate::messages::ClientFrame;
use crate::session::SessionEvent;
use crate::types::{MediaSpec, MediaType, Role};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffer for ICE candidates that arrive before the endpoint knows its
/// media id. Once flushed, candidates forward directly; the tokio lock is
/// held across the forwarding RPC so delivery keeps arrival order.
#[derive(Debug, Default)]
pub struct IceQueue {
    flushed: bool,
    queue: Vec<Value>,
}

impl IceQueue {
    pub fn push(&mut self, candidate: Value) {
        self.queue.push(candidate);
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Drain the buffer and mark the queue flushed.
    pub fn take_pending(&mut self) -> Vec<Value> {
        self.flushed = true;
        std::mem::take(&mut self.queue)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Everything an endpoint variant needs, owned by value.
#[derive(Clone)]
pub(crate) struct EndpointParams {
    pub media_type: MediaType,
    /// Canonical session key string, for logs and events.
    pub key: String,
    pub user_id: String,
    pub connection_id: String,
    pub meeting_id: String,
    pub voice_bridge: String,
    pub resource_id: String,
    pub role: Role,
    pub media_server: String,
    pub media_spec: MediaSpec,
    pub record: bool,
    pub source_stream: Option<String>,
    pub mcs: Arc<dyn McsGateway>,
    pub bus: Arc<dyn BusGateway>,
    pub bridges: Arc<BridgeRegistry>,
    pub events_tx: mpsc::UnboundedSender<SessionEvent>,
    pub ice_queue: Arc<tokio::sync::Mutex<IceQueue>>,
    pub flow_timeout: Duration,
    pub state_timeout: Duration,
}

impl EndpointParams {
    fn session_event(&self, build: fn(String, String, String, Role) -> SessionEvent) -> SessionEvent {
        build(
            self.key.clone(),
            self.connection_id.clone(),
            self.resource_id.clone(),
            self.role,
        )
    }
}

/// One idempotent timer: arming while armed is a no-op, clearing aborts.
/// After firing, the slot empties itself so a later negative transition
/// can arm again.
pub(crate) struct Watchdog {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(None),
        })
    }

    pub fn arm(self: &Arc<Self>, duration: Duration, on_expire: impl FnOnce() + Send + 'static) {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_expire();
            this.handle.lock().take();
        }));
    }

    pub fn clear(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.lock().is_some()
    }
}

/// Drive one media's MCS events: watchdog transitions, flow
/// notifications, server-side candidate relay, and the offline signal.
pub(crate) fn spawn_media_listener(
    params: EndpointParams,
    flow_watchdog: Arc<Watchdog>,
    state_watchdog: Arc<Watchdog>,
    mut events: MediaEventStream,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                McsEvent::MediaState { connected: true } => {
                    state_watchdog.clear();
                }
                McsEvent::MediaState { connected: false } => {
                    let tx = params.events_tx.clone();
                    let event = params.session_event(SessionEvent::media_timeout);
                    state_watchdog.arm(params.state_timeout, move || {
                        let _ = tx.send(event);
                    });
                }
                McsEvent::MediaFlow { flowing: true, .. } => {
                    flow_watchdog.clear();
                    if params.media_type == MediaType::Audio {
                        let _ = params
                            .bus
                            .send_to_client(&params.connection_id, &ClientFrame::media_flowing())
                            .await;
                    }
                }
                McsEvent::MediaFlow { flowing: false, .. } => {
                    let tx = params.events_tx.clone();
                    let event = params.session_event(SessionEvent::media_timeout);
                    flow_watchdog.arm(params.flow_timeout, move || {
                        let _ = tx.send(event);
                    });
                }
                McsEvent::IceCandidate { candidate } => {
                    let frame = ClientFrame::IceCandidate {
                        media_type: params.media_type.as_str().to_string(),
                        candidate,
                    };
                    let _ = params
                        .bus
                        .send_to_client(&params.connection_id, &frame)
                        .await;
                }
                McsEvent::ServerOffline => {
                    let _ = params
                        .events_tx
                        .send(params.session_event(SessionEvent::server_offline));
                    break;
                }
            }
        }
    })
}

/// A single media session with the MCS, behind a uniform contract.
pub enum Endpoint {
    Publisher(PublisherEndpoint),
    Consumer(ConsumerEndpoint),
}

impl Endpoint {
    /// Negotiate the session, returning the descriptor for the client
    /// (`startResponse.sdpAnswer`).
    pub async fn start(&self, offer: Option<&str>) -> Result<String> {
        match self {
            Endpoint::Publisher(e) => e.start(offer).await,
            Endpoint::Consumer(e) => e.start(offer).await,
        }
    }

    pub async fn on_ice_candidate(&self, candidate: &Value) -> Result<()> {
        match self {
            Endpoint::Publisher(e) => e.on_ice_candidate(candidate).await,
            Endpoint::Consumer(e) => e.on_ice_candidate(candidate).await,
        }
    }

    pub async fn process_answer(&self, descriptor: &str) -> Result<()> {
        match self {
            Endpoint::Publisher(e) => e.process_answer(descriptor).await,
            Endpoint::Consumer(e) => e.process_answer(descriptor).await,
        }
    }

    /// DTMF capability: audio publishers forward to the MCS, everything
    /// else returns empty digits.
    pub async fn dtmf(&self, tones: &str) -> Result<String> {
        match self {
            Endpoint::Publisher(e) => e.dtmf(tones).await,
            Endpoint::Consumer(_) => Ok(String::new()),
        }
    }

    /// ICE-restart capability: publishers return the fresh offer,
    /// consumers resolve without one.
    pub async fn restart_ice(&self) -> Result<Option<String>> {
        match self {
            Endpoint::Publisher(e) => e.restart_ice().await,
            Endpoint::Consumer(_) => Ok(None),
        }
    }

    pub async fn stop(&self) {
        match self {
            Endpoint::Publisher(e) => e.stop().await,
            Endpoint::Consumer(e) => e.stop().await,
        }
    }

    pub fn media_id(&self) -> Option<String> {
        match self {
            Endpoint::Publisher(e) => e.media_id(),
            Endpoint::Consumer(e) => e.media_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_queue_drains_once() {
        let mut queue = IceQueue::default();
        queue.push(serde_json::json!("C1"));
        queue.push(serde_json::json!("C2"));
        assert!(!queue.is_flushed());

        let pending = queue.take_pending();
        assert_eq!(pending, vec![serde_json::json!("C1"), serde_json::json!("C2")]);
        assert!(queue.is_flushed());
        assert!(queue.is_empty());
        assert!(queue.take_pending().is_empty());
    }

    #[tokio::test]
    async fn watchdog_arm_is_idempotent_and_clear_aborts() {
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let watchdog = Watchdog::new();

        for _ in 0..3 {
            let fired = fired.clone();
            watchdog.arm(Duration::from_millis(20), move || {
                fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        assert!(watchdog.is_armed());
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Three arms, one timer, one firing.
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        // The slot empties after firing, so it can arm again.
        assert!(!watchdog.is_armed());

        let fired2 = fired.clone();
        watchdog.arm(Duration::from_millis(50), move || {
            fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        watchdog.clear();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
