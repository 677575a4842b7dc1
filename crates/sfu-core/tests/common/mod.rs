//! Mock gateways and fixtures for lifecycle tests.
//!
//! The MCS and bus mocks record every call so tests can assert ordering
//! (candidate flush order, unpublish-before-replacement and the like).

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sfu_core::bridge::BridgeRegistry;
use sfu_core::bus::{BusGateway, MeetingEvent, MeetingEventStream};
use sfu_core::config::SfuConfig;
use sfu_core::manager::Manager;
use sfu_core::mcs::{
    DisconnectStream, JoinOptions, McsEvent, McsGateway, MediaEventStream, NegotiatedMedia,
    PublishOptions, SubscribeOptions,
};
use sfu_core::messages::ClientFrame;
use sfu_core::permissions::PermissionOracle;
use sfu_core::sources::SourceRegistry;
use sfu_core::types::MediaType;
use sfu_core::{Result, SfuError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum McsCall {
    Join {
        room: String,
        external_user_id: String,
    },
    Publish {
        mcs_user_id: String,
        room: String,
        offer: Option<String>,
        adapter: String,
        record: bool,
        media_id: String,
    },
    Subscribe {
        source: String,
        media_id: String,
    },
    Consume {
        source: String,
        sink: String,
    },
    Connect {
        source: String,
        sink: String,
    },
    AddIceCandidate {
        media_id: String,
        candidate: Value,
    },
    ProcessAnswer {
        media_id: String,
        answer: String,
    },
    Unpublish {
        mcs_user_id: String,
        media_id: String,
    },
    RestartIce {
        media_id: String,
    },
    Dtmf {
        media_id: String,
        tones: String,
    },
}

pub struct MockMcs {
    pub connected: AtomicBool,
    pub fail_publish: AtomicBool,
    /// Delay applied inside `publish`, to hold a negotiation in flight
    /// while concurrent callers pile up behind it.
    publish_delay_ms: AtomicU64,
    /// Publish RPCs attempted, including ones that failed.
    publish_attempts: AtomicU64,
    calls: Mutex<Vec<McsCall>>,
    counter: AtomicU64,
    media_subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<McsEvent>>>>,
    disconnect_subscribers: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl MockMcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            publish_delay_ms: AtomicU64::new(0),
            publish_attempts: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
            media_subscribers: Mutex::new(HashMap::new()),
            disconnect_subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> u64 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    fn next_media_id(&self) -> String {
        format!("media-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn record(&self, call: McsCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<McsCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published_media_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                McsCall::Publish { media_id, .. } => Some(media_id),
                _ => None,
            })
            .collect()
    }

    pub fn subscribed_media_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                McsCall::Subscribe { media_id, .. } => Some(media_id),
                _ => None,
            })
            .collect()
    }

    pub fn ice_candidates(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                McsCall::AddIceCandidate { candidate, .. } => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn index_of<F: Fn(&McsCall) -> bool>(&self, pred: F) -> Option<usize> {
        self.calls().iter().position(|c| pred(c))
    }

    pub fn last_index_of<F: Fn(&McsCall) -> bool>(&self, pred: F) -> Option<usize> {
        self.calls().iter().rposition(|c| pred(c))
    }

    pub fn emit_media_event(&self, media_id: &str, event: McsEvent) {
        if let Some(subscribers) = self.media_subscribers.lock().unwrap().get_mut(media_id) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn emit_disconnected(&self) {
        self.disconnect_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(()).is_ok());
    }
}

#[async_trait]
impl McsGateway for MockMcs {
    async fn wait_for_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join(&self, room: &str, _kind: &str, opts: JoinOptions) -> Result<String> {
        self.record(McsCall::Join {
            room: room.to_string(),
            external_user_id: opts.external_user_id,
        });
        Ok(format!("user-{}", Uuid::new_v4()))
    }

    async fn publish(
        &self,
        mcs_user_id: &str,
        room: &str,
        _media_type: MediaType,
        opts: PublishOptions,
    ) -> Result<NegotiatedMedia> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SfuError::negotiation_failed("publish refused by mock"));
        }
        let media_id = self.next_media_id();
        self.record(McsCall::Publish {
            mcs_user_id: mcs_user_id.to_string(),
            room: room.to_string(),
            offer: opts.sdp_offer,
            adapter: opts.adapter,
            record: opts.record,
            media_id: media_id.clone(),
        });
        Ok(NegotiatedMedia {
            sdp_answer: format!("answer-{}", media_id),
            media_id,
        })
    }

    async fn subscribe(
        &self,
        _mcs_user_id: &str,
        source_media_id: &str,
        _media_type: MediaType,
        _opts: SubscribeOptions,
    ) -> Result<NegotiatedMedia> {
        let media_id = self.next_media_id();
        self.record(McsCall::Subscribe {
            source: source_media_id.to_string(),
            media_id: media_id.clone(),
        });
        Ok(NegotiatedMedia {
            sdp_answer: format!("answer-{}", media_id),
            media_id,
        })
    }

    async fn consume(
        &self,
        source_media_id: &str,
        sink_media_id: &str,
        _media_type: MediaType,
    ) -> Result<String> {
        self.record(McsCall::Consume {
            source: source_media_id.to_string(),
            sink: sink_media_id.to_string(),
        });
        Ok(format!("answer-consume-{}", sink_media_id))
    }

    async fn connect(
        &self,
        source_media_id: &str,
        sink_media_id: &str,
        _media_type: MediaType,
    ) -> Result<()> {
        self.record(McsCall::Connect {
            source: source_media_id.to_string(),
            sink: sink_media_id.to_string(),
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, media_id: &str, candidate: &Value) -> Result<()> {
        self.record(McsCall::AddIceCandidate {
            media_id: media_id.to_string(),
            candidate: candidate.clone(),
        });
        Ok(())
    }

    async fn process_answer(&self, media_id: &str, answer: &str) -> Result<()> {
        self.record(McsCall::ProcessAnswer {
            media_id: media_id.to_string(),
            answer: answer.to_string(),
        });
        Ok(())
    }

    async fn unpublish(&self, mcs_user_id: &str, media_id: &str) -> Result<()> {
        self.record(McsCall::Unpublish {
            mcs_user_id: mcs_user_id.to_string(),
            media_id: media_id.to_string(),
        });
        Ok(())
    }

    async fn restart_ice(&self, media_id: &str) -> Result<String> {
        self.record(McsCall::RestartIce {
            media_id: media_id.to_string(),
        });
        Ok(format!("restart-offer-{}", media_id))
    }

    async fn dtmf(&self, media_id: &str, tones: &str) -> Result<String> {
        self.record(McsCall::Dtmf {
            media_id: media_id.to_string(),
            tones: tones.to_string(),
        });
        Ok(tones.to_string())
    }

    fn media_events(&self, media_id: &str) -> MediaEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.media_subscribers
            .lock()
            .unwrap()
            .entry(media_id.to_string())
            .or_default()
            .push(tx);
        MediaEventStream::new(rx)
    }

    fn disconnect_events(&self) -> DisconnectStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.disconnect_subscribers.lock().unwrap().push(tx);
        DisconnectStream::new(rx)
    }
}

pub struct MockBus {
    frames: Mutex<Vec<(String, ClientFrame)>>,
    meeting_subscribers: Mutex<Vec<mpsc::UnboundedSender<MeetingEvent>>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            meeting_subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<(String, ClientFrame)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frames_for(&self, connection_id: &str) -> Vec<ClientFrame> {
        self.frames()
            .into_iter()
            .filter(|(conn, _)| conn == connection_id)
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn error_codes(&self) -> Vec<u32> {
        self.frames()
            .into_iter()
            .filter_map(|(_, frame)| frame.error_body().map(|body| body.code))
            .collect()
    }

    pub fn emit_meeting_event(&self, event: MeetingEvent) {
        self.meeting_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl BusGateway for MockBus {
    async fn send_to_client(&self, connection_id: &str, frame: &ClientFrame) -> Result<()> {
        self.frames
            .lock()
            .unwrap()
            .push((connection_id.to_string(), frame.clone()));
        Ok(())
    }

    fn meeting_events(&self) -> MeetingEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.meeting_subscribers.lock().unwrap().push(tx);
        MeetingEventStream::new(rx)
    }
}

pub struct MockOracle {
    pub allow: AtomicBool,
}

impl MockOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allow: AtomicBool::new(true),
        })
    }

    pub fn deny(&self) {
        self.allow.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PermissionOracle for MockOracle {
    async fn can_broadcast(&self, _user: &str, _meeting: &str, _camera: &str) -> Result<bool> {
        Ok(self.allow.load(Ordering::SeqCst))
    }

    async fn can_subscribe(&self, _user: &str, _meeting: &str, _camera: &str) -> Result<bool> {
        Ok(self.allow.load(Ordering::SeqCst))
    }

    async fn can_speak(&self, _user: &str, _meeting: &str, _bridge: &str) -> Result<bool> {
        Ok(self.allow.load(Ordering::SeqCst))
    }
}

pub struct Fixture {
    pub manager: Arc<Manager>,
    pub mcs: Arc<MockMcs>,
    pub bus: Arc<MockBus>,
    pub oracle: Arc<MockOracle>,
    pub bridges: Arc<BridgeRegistry>,
    pub sources: Arc<SourceRegistry>,
    pub registry: prometheus::Registry,
}

/// Route test logs through `RUST_LOG`; repeat initialization is fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn fixture_with(media_type: MediaType, config: SfuConfig) -> Fixture {
    init_tracing();
    let mcs = MockMcs::new();
    let bus = MockBus::new();
    let oracle = MockOracle::new();
    let bridges = Arc::new(BridgeRegistry::new());
    let sources = Arc::new(SourceRegistry::new());
    let registry = prometheus::Registry::new();

    let manager = Manager::new(
        media_type,
        Arc::new(config),
        mcs.clone(),
        bus.clone(),
        oracle.clone(),
        bridges.clone(),
        sources.clone(),
        &registry,
    )
    .expect("metrics registration failed");

    Fixture {
        manager,
        mcs,
        bus,
        oracle,
        bridges,
        sources,
        registry,
    }
}

pub fn video_fixture() -> Fixture {
    fixture_with(MediaType::Video, SfuConfig::default())
}

pub fn audio_fixture() -> Fixture {
    fixture_with(MediaType::Audio, SfuConfig::default())
}

/// Poll a condition until it holds or the test times out.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
