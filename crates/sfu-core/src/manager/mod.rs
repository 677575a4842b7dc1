//! Session manager
//!
//! Top-level dispatcher for one media type. Owns the session table, the
//! per-session lifecycle queues, the pending-ICE queues and the inbound
//! router, and funnels every client-visible error through one place.

mod queue;

use crate::bridge::BridgeRegistry;
use crate::bus::{BusGateway, MeetingEvent};
use crate::config::SfuConfig;
use crate::endpoint::IceQueue;
use crate::errors::{Result, SfuError};
use crate::mcs::McsGateway;
use crate::messages::{
    ClientFrame, DtmfRequest, Envelope, HeaderOutcome, IceCandidateRequest, IdentityRequest,
    StartRequest, SubscriberAnswerRequest,
};
use crate::metrics::SfuMetrics;
use crate::permissions::PermissionOracle;
use crate::session::{Session, SessionContext, SessionDescriptor, SessionEvent};
use crate::sources::SourceRegistry;
use crate::types::{MediaType, Role, SessionKey, SessionStatus};
use dashmap::DashMap;
use queue::LifecycleQueues;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Adapter used for audio media when the request does not name one.
const DEFAULT_AUDIO_ADAPTER: &str = "mediasoup";

pub struct Manager {
    media_type: MediaType,
    config: Arc<SfuConfig>,
    mcs: Arc<dyn McsGateway>,
    bus: Arc<dyn BusGateway>,
    oracle: Arc<dyn PermissionOracle>,
    bridges: Arc<BridgeRegistry>,
    sources: Arc<SourceRegistry>,
    sessions: DashMap<String, Arc<Session>>,
    queues: LifecycleQueues,
    pending_ice: DashMap<String, Arc<tokio::sync::Mutex<IceQueue>>>,
    metrics: SfuMetrics,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media_type: MediaType,
        config: Arc<SfuConfig>,
        mcs: Arc<dyn McsGateway>,
        bus: Arc<dyn BusGateway>,
        oracle: Arc<dyn PermissionOracle>,
        bridges: Arc<BridgeRegistry>,
        sources: Arc<SourceRegistry>,
        registry: &prometheus::Registry,
    ) -> prometheus::Result<Arc<Self>> {
        let metrics = SfuMetrics::new(registry, media_type)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            media_type,
            config,
            mcs,
            bus,
            oracle,
            bridges,
            sources,
            sessions: DashMap::new(),
            queues: LifecycleQueues::new(),
            pending_ice: DashMap::new(),
            metrics,
            events_tx,
        });

        manager.spawn_event_loop(events_rx);
        if media_type == MediaType::Video {
            manager.spawn_source_watcher();
        }
        Ok(manager)
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn metrics(&self) -> &SfuMetrics {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_status(&self, key: &str) -> Option<SessionStatus> {
        self.sessions.get(key).map(|entry| entry.value().status())
    }

    /// Parse and dispatch a raw bus payload.
    pub async fn on_raw_message(self: &Arc<Self>, raw: &str) {
        match Envelope::parse(raw) {
            Ok(envelope) => self.on_message(envelope).await,
            Err(e) => {
                tracing::warn!("[{}] Discarding unparseable message: {}", self.media_type, e);
                self.metrics.count_error("parse", e.error_code());
            }
        }
    }

    /// Route one inbound message. Lifecycle operations serialize on the
    /// session key's queue; ICE, restart and DTMF delivery run
    /// immediately for latency.
    pub async fn on_message(self: &Arc<Self>, envelope: Envelope) {
        self.metrics.reqs_total.inc();

        if envelope.header == HeaderOutcome::Malformed && self.config.ws_strict_header_parsing {
            let error = SfuError::invalid_request("malformed user-info header");
            self.handle_error(&envelope.id, &envelope.connection_id, "", None, &error)
                .await;
            return;
        }

        match envelope.id.as_str() {
            "start" => match envelope.decode::<StartRequest>() {
                Ok(req) => self.enqueue_start(req).await,
                Err(e) => {
                    self.handle_error("start", &envelope.connection_id, "", None, &e)
                        .await
                }
            },
            "subscriberAnswer" => match envelope.decode::<SubscriberAnswerRequest>() {
                Ok(req) => self.enqueue_subscriber_answer(req).await,
                Err(e) => {
                    self.handle_error("subscriberAnswer", &envelope.connection_id, "", None, &e)
                        .await
                }
            },
            "stop" => match envelope.decode::<IdentityRequest>() {
                Ok(req) => self.enqueue_stop(req).await,
                Err(e) => {
                    self.handle_error("stop", &envelope.connection_id, "", None, &e)
                        .await
                }
            },
            "onIceCandidate" => {
                let outcome = match envelope.decode::<IceCandidateRequest>() {
                    Ok(req) => self.handle_ice_candidate(req).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    self.handle_error("onIceCandidate", &envelope.connection_id, "", None, &e)
                        .await;
                }
            }
            "restartIce" => {
                let outcome = match envelope.decode::<IdentityRequest>() {
                    Ok(req) => self.handle_restart_ice(req).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    self.handle_error("restartIce", &envelope.connection_id, "", None, &e)
                        .await;
                }
            }
            "dtmf" => {
                let outcome = match envelope.decode::<DtmfRequest>() {
                    Ok(req) => self.handle_dtmf(req).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    self.handle_error("dtmf", &envelope.connection_id, "", None, &e)
                        .await;
                }
            }
            "close" => self.kill_connection_sessions(&envelope.connection_id).await,
            "error" => {
                tracing::warn!(
                    "[{}] Upstream error reported on connection {}",
                    self.media_type,
                    envelope.connection_id
                );
            }
            unknown => {
                let error = SfuError::invalid_request(format!("unknown request id {}", unknown));
                self.handle_error(unknown, &envelope.connection_id, "", None, &error)
                    .await;
            }
        }
    }

    /// Compose the session key from a request's identity fields.
    fn resolve_key(
        &self,
        user_id: &str,
        role_raw: &str,
        camera_id: Option<&str>,
        voice_bridge: &str,
    ) -> Result<SessionKey> {
        let role = Role::parse(self.media_type, role_raw)
            .ok_or_else(|| SfuError::invalid_request(format!("invalid role {}", role_raw)))?;
        if user_id.is_empty() {
            return Err(SfuError::invalid_request("missing user id"));
        }
        let resource_id = match self.media_type {
            MediaType::Video => camera_id
                .filter(|c| !c.is_empty())
                .ok_or_else(|| SfuError::invalid_request("missing camera id"))?
                .to_string(),
            MediaType::Audio => {
                if voice_bridge.is_empty() {
                    return Err(SfuError::invalid_request("missing voice bridge"));
                }
                voice_bridge.to_string()
            }
        };
        Ok(SessionKey::new(user_id, resource_id, role))
    }

    fn ice_queue_for(&self, key: &str) -> Arc<tokio::sync::Mutex<IceQueue>> {
        self.pending_ice
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            mcs: self.mcs.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            bridges: self.bridges.clone(),
            events_tx: self.events_tx.clone(),
        }
    }

    async fn enqueue_start(self: &Arc<Self>, req: StartRequest) {
        let key = match self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        ) {
            Ok(key) => key,
            Err(e) => {
                self.handle_error("start", &req.connection_id, "", None, &e)
                    .await;
                return;
            }
        };

        let key_str = key.to_string();
        let manager = self.clone();
        let connection_id = req.connection_id.clone();
        let resource_id = key.resource_id.clone();
        let role = key.role;
        self.queues.enqueue(
            &key_str,
            Box::pin(async move {
                if let Err(e) = manager.handle_start(key, req).await {
                    manager
                        .handle_error("start", &connection_id, &resource_id, Some(role), &e)
                        .await;
                }
            }),
        );
    }

    /// Runs inside the key's lifecycle queue slot: stale replacement,
    /// authorization, endpoint negotiation and the start response.
    async fn handle_start(self: &Arc<Self>, key: SessionKey, req: StartRequest) -> Result<()> {
        let key_str = key.to_string();

        if self.media_type == MediaType::Audio
            && key.role == Role::SendRecv
            && !self.config.full_audio_enabled
        {
            return Err(SfuError::invalid_request("sendrecv audio is disabled"));
        }

        // An existing entry under this key is driven to STOPPED first,
        // inside this same queue slot.
        if self.sessions.contains_key(&key_str) {
            tracing::info!("[{}] Replacing stale session {}", self.media_type, key_str);
            self.close_session(&key_str).await;
        }

        let allowed = match (self.media_type, key.role) {
            (MediaType::Video, Role::Share) => {
                self.oracle
                    .can_broadcast(&key.user_id, &req.meeting_id, &key.resource_id)
                    .await?
            }
            (MediaType::Video, Role::Viewer) => {
                self.oracle
                    .can_subscribe(&key.user_id, &req.meeting_id, &key.resource_id)
                    .await?
            }
            (MediaType::Audio, _) => {
                self.oracle
                    .can_speak(&key.user_id, &req.meeting_id, &req.voice_bridge)
                    .await?
            }
            _ => false,
        };
        if !allowed {
            return Err(SfuError::PermissionDenied);
        }

        let source_stream = match self.media_type {
            MediaType::Video => self
                .sources
                .resolve(&key.resource_id)
                .or_else(|| self.sources.resolve(&key.user_id)),
            MediaType::Audio => None,
        };

        let media_server = req
            .media_server
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| match self.media_type {
                MediaType::Video => self.config.video_media_server.clone(),
                MediaType::Audio => DEFAULT_AUDIO_ADAPTER.to_string(),
            });

        let descriptor = SessionDescriptor {
            key: key.clone(),
            media_type: self.media_type,
            connection_id: req.connection_id.clone(),
            meeting_id: req.meeting_id.clone(),
            voice_bridge: req.voice_bridge.clone(),
            media_server,
            media_spec: self.config.media_specs.with_requested_bitrate(req.bitrate),
            record: req.record,
            source_stream,
            caller_id: req.caller_id.clone(),
        };

        let ice_queue = self.ice_queue_for(&key_str);
        let session = Session::new(descriptor, self.session_context(), ice_queue);
        self.sessions.insert(key_str.clone(), session.clone());
        self.metrics.sessions.set(self.sessions.len() as i64);

        match session.start(req.sdp_offer.as_deref()).await {
            Ok(sdp_answer) => {
                // The table may have changed across the negotiation.
                if !self.sessions.contains_key(&key_str) {
                    return Ok(());
                }
                let frame = ClientFrame::StartResponse {
                    media_type: self.media_type.as_str().to_string(),
                    role: key.role.as_str().to_string(),
                    camera_id: match self.media_type {
                        MediaType::Video => Some(key.resource_id.clone()),
                        MediaType::Audio => None,
                    },
                    caller_id: req.caller_id.clone(),
                    sdp_answer,
                };
                let _ = self.bus.send_to_client(&req.connection_id, &frame).await;
                Ok(())
            }
            Err(e) => {
                session.stop().await;
                self.sessions.remove(&key_str);
                self.pending_ice.remove(&key_str);
                self.metrics.sessions.set(self.sessions.len() as i64);
                Err(e)
            }
        }
    }

    async fn enqueue_subscriber_answer(self: &Arc<Self>, req: SubscriberAnswerRequest) {
        let key = match self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        ) {
            Ok(key) => key,
            Err(e) => {
                self.handle_error("subscriberAnswer", &req.connection_id, "", None, &e)
                    .await;
                return;
            }
        };

        let key_str = key.to_string();
        let manager = self.clone();
        let connection_id = req.connection_id.clone();
        let resource_id = key.resource_id.clone();
        let role = key.role;
        let lookup_key = key_str.clone();
        self.queues.enqueue(
            &key_str,
            Box::pin(async move {
                // No matching session resolves without side effects.
                let outcome = match manager.lookup(&lookup_key) {
                    Some(session) => session.process_answer(&req.answer).await,
                    None => Ok(()),
                };
                if let Err(e) = outcome {
                    manager
                        .handle_error(
                            "subscriberAnswer",
                            &connection_id,
                            &resource_id,
                            Some(role),
                            &e,
                        )
                        .await;
                }
            }),
        );
    }

    async fn enqueue_stop(self: &Arc<Self>, req: IdentityRequest) {
        let key = match self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        ) {
            Ok(key) => key,
            Err(e) => {
                self.handle_error("stop", &req.connection_id, "", None, &e)
                    .await;
                return;
            }
        };

        let key_str = key.to_string();
        let manager = self.clone();
        self.queues.enqueue(
            &key_str.clone(),
            Box::pin(async move {
                manager.close_session(&key_str).await;
            }),
        );
    }

    /// ICE delivery deliberately bypasses the lifecycle queue; ordering
    /// is preserved by the pending-ICE queue.
    async fn handle_ice_candidate(&self, req: IceCandidateRequest) -> Result<()> {
        let key = self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        )?;
        let key_str = key.to_string();

        match self.lookup(&key_str) {
            Some(session) if session.is_ready() => {
                session.on_ice_candidate(&req.candidate).await
            }
            _ => {
                // No endpoint yet: buffer until the first one for this
                // key reports readiness.
                let queue = self.ice_queue_for(&key_str);
                queue.lock().await.push(req.candidate.clone());
                Ok(())
            }
        }
    }

    async fn handle_restart_ice(&self, req: IdentityRequest) -> Result<()> {
        let key = self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        )?;
        let session = match self.lookup(&key.to_string()) {
            Some(session) => session,
            None => return Ok(()),
        };
        if let Some(sdp) = session.restart_ice().await? {
            let frame = ClientFrame::RestartIceResponse {
                media_type: self.media_type.as_str().to_string(),
                sdp,
            };
            let _ = self.bus.send_to_client(&req.connection_id, &frame).await;
        }
        Ok(())
    }

    async fn handle_dtmf(&self, req: DtmfRequest) -> Result<()> {
        let key = self.resolve_key(
            &req.user_id,
            &req.role,
            req.camera_id.as_deref(),
            &req.voice_bridge,
        )?;
        let session = match self.lookup(&key.to_string()) {
            Some(session) => session,
            None => return Ok(()),
        };
        let digits = session.dtmf(&req.tones).await?;
        let frame = ClientFrame::DtmfResponse {
            media_type: self.media_type.as_str().to_string(),
            digits,
        };
        let _ = self.bus.send_to_client(&req.connection_id, &frame).await;
        Ok(())
    }

    /// Close every session owned by a vanished connection. Iteration is
    /// over a key snapshot; each close serializes on its own queue.
    pub async fn kill_connection_sessions(self: &Arc<Self>, connection_id: &str) {
        let keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().connection_id() == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        if keys.is_empty() {
            return;
        }
        tracing::info!(
            "[{}] Closing {} sessions for connection {}",
            self.media_type,
            keys.len(),
            connection_id
        );
        for key in keys {
            let manager = self.clone();
            let key_for_task = key.clone();
            self.queues.enqueue(
                &key,
                Box::pin(async move {
                    manager.close_session(&key_for_task).await;
                }),
            );
        }
    }

    /// Stop, remove, and drop the pending-ICE queue. Safe to call for an
    /// absent key.
    pub(crate) async fn close_session(&self, key: &str) {
        if let Some(session) = self.lookup(key) {
            session.stop().await;
            self.sessions.remove(key);
            self.metrics.sessions.set(self.sessions.len() as i64);
        }
        self.pending_ice.remove(key);
    }

    /// Drive every session to STOPPED through its lifecycle queue and
    /// wait for the queues to drain. For process teardown.
    pub async fn stop_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let manager = self.clone();
            let key_for_task = key.clone();
            self.queues.enqueue(
                &key,
                Box::pin(async move {
                    manager.close_session(&key_for_task).await;
                }),
            );
        }
        while self.queues.len() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Single funnel for every client-visible failure: normalize to the
    /// catalogue, publish the error frame, count the labelled metric.
    pub(crate) async fn handle_error(
        &self,
        method: &str,
        connection_id: &str,
        resource_id: &str,
        role: Option<Role>,
        error: &SfuError,
    ) {
        let code = error.error_code();
        tracing::error!(
            "[{}] {} failed for connection {}: {}",
            self.media_type,
            method,
            connection_id,
            error
        );
        if !connection_id.is_empty() {
            let camera_id = match self.media_type {
                MediaType::Video if !resource_id.is_empty() => Some(resource_id.to_string()),
                _ => None,
            };
            let frame =
                ClientFrame::error(self.media_type, role, camera_id, code, error.client_reason());
            let _ = self.bus.send_to_client(connection_id, &frame).await;
        }
        self.metrics.count_error(method, code);
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.on_session_event(event).await;
            }
        });
    }

    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::UserLeft {
                key, connection_id, ..
            } => {
                if !self.sessions.contains_key(&key) {
                    return;
                }
                tracing::info!("[{}] Ejecting {}: user left meeting", self.media_type, key);
                let manager: Arc<Manager> = self.clone();
                let key_for_task = key.clone();
                let frame = ClientFrame::Close {
                    media_type: self.media_type.as_str().to_string(),
                };
                self.queues.enqueue(
                    &key,
                    Box::pin(async move {
                        manager.close_session(&key_for_task).await;
                        let _ = manager.bus.send_to_client(&connection_id, &frame).await;
                    }),
                );
            }
            SessionEvent::ServerOffline {
                key,
                connection_id,
                resource_id,
                role,
            } => {
                if !self.sessions.contains_key(&key) {
                    return;
                }
                self.handle_error(
                    "event",
                    &connection_id,
                    &resource_id,
                    Some(role),
                    &SfuError::MediaServerOffline,
                )
                .await;
                let manager: Arc<Manager> = self.clone();
                let key_for_task = key.clone();
                self.queues.enqueue(
                    &key,
                    Box::pin(async move {
                        manager.close_session(&key_for_task).await;
                    }),
                );
            }
            SessionEvent::MediaTimeout {
                key,
                connection_id,
                resource_id,
                role,
            } => {
                if !self.sessions.contains_key(&key) {
                    return;
                }
                self.handle_error(
                    "event",
                    &connection_id,
                    &resource_id,
                    Some(role),
                    &SfuError::MediaTimeout,
                )
                .await;
            }
        }
    }

    /// Track external (SIP-dialed) webcam sources announced on the bus.
    fn spawn_source_watcher(self: &Arc<Self>) {
        let mut events = self.bus.meeting_events();
        let sources = self.sources.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let MeetingEvent::CamBroadcastStarted {
                    stream_name,
                    user_id,
                } = event
                {
                    sources.register(&stream_name, &user_id);
                }
            }
        });
    }
}
