//! Per-client session
//!
//! Owns exactly one endpoint and the subscription handles for the two
//! external events that can end it from the outside: the owner leaving
//! the meeting and the media server disconnecting. Everything the
//! endpoint cannot do returns its documented default.

use crate::bridge::BridgeRegistry;
use crate::bus::{BusGateway, MeetingEvent};
use crate::config::SfuConfig;
use crate::endpoint::{ConsumerEndpoint, Endpoint, EndpointParams, IceQueue, PublisherEndpoint};
use crate::errors::Result;
use crate::mcs::McsGateway;
use crate::types::{MediaSpec, MediaType, Role, SessionKey, SessionStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notifications a session (or its endpoint) raises towards the manager.
/// The manager owns the reaction: error funnel, close-frame emission and
/// the lifecycle-queue close.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserLeft {
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    },
    ServerOffline {
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    },
    MediaTimeout {
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    },
}

impl SessionEvent {
    pub(crate) fn user_left(
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    ) -> Self {
        SessionEvent::UserLeft {
            key,
            connection_id,
            resource_id,
            role,
        }
    }

    pub(crate) fn server_offline(
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    ) -> Self {
        SessionEvent::ServerOffline {
            key,
            connection_id,
            resource_id,
            role,
        }
    }

    pub(crate) fn media_timeout(
        key: String,
        connection_id: String,
        resource_id: String,
        role: Role,
    ) -> Self {
        SessionEvent::MediaTimeout {
            key,
            connection_id,
            resource_id,
            role,
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub mcs: Arc<dyn McsGateway>,
    pub bus: Arc<dyn BusGateway>,
    pub config: Arc<SfuConfig>,
    pub bridges: Arc<BridgeRegistry>,
    pub events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Identity of one session, resolved by the manager before construction.
#[derive(Debug, Clone)]
pub(crate) struct SessionDescriptor {
    pub key: SessionKey,
    pub media_type: MediaType,
    pub connection_id: String,
    pub meeting_id: String,
    pub voice_bridge: String,
    pub media_server: String,
    pub media_spec: MediaSpec,
    pub record: bool,
    pub source_stream: Option<String>,
    pub caller_id: Option<String>,
}

pub struct Session {
    descriptor: SessionDescriptor,
    /// Canonical key string; immutable for the session's lifetime.
    key: String,
    ctx: SessionContext,
    status: parking_lot::Mutex<SessionStatus>,
    endpoint: tokio::sync::Mutex<Option<Endpoint>>,
    watchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    ice_queue: Arc<tokio::sync::Mutex<IceQueue>>,
}

impl Session {
    pub(crate) fn new(
        descriptor: SessionDescriptor,
        ctx: SessionContext,
        ice_queue: Arc<tokio::sync::Mutex<IceQueue>>,
    ) -> Arc<Self> {
        let key = descriptor.key.to_string();
        let session = Arc::new(Self {
            descriptor,
            key,
            ctx,
            status: parking_lot::Mutex::new(SessionStatus::Starting),
            endpoint: tokio::sync::Mutex::new(None),
            watchers: parking_lot::Mutex::new(Vec::new()),
            ice_queue,
        });
        session.spawn_watchers();
        session
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn connection_id(&self) -> &str {
        &self.descriptor.connection_id
    }

    pub fn role(&self) -> Role {
        self.descriptor.key.role
    }

    pub fn resource_id(&self) -> &str {
        &self.descriptor.key.resource_id
    }

    pub fn meeting_id(&self) -> &str {
        &self.descriptor.meeting_id
    }

    pub fn caller_id(&self) -> Option<&str> {
        self.descriptor.caller_id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.lock();
        tracing::debug!("Session {} status {:?} -> {:?}", self.key, *current, status);
        *current = status;
    }

    /// Watchers hold only the identity strings they need, never the
    /// session itself.
    fn spawn_watchers(self: &Arc<Self>) {
        let mut watchers = Vec::new();

        if self.ctx.config.eject_on_user_left {
            let mut events = self.ctx.bus.meeting_events();
            let tx = self.ctx.events_tx.clone();
            let event = SessionEvent::user_left(
                self.key.clone(),
                self.descriptor.connection_id.clone(),
                self.descriptor.key.resource_id.clone(),
                self.descriptor.key.role,
            );
            let meeting_id = self.descriptor.meeting_id.clone();
            let user_id = self.descriptor.key.user_id.clone();
            watchers.push(tokio::spawn(async move {
                while let Some(ev) = events.recv().await {
                    if let MeetingEvent::UserLeft {
                        meeting_id: m,
                        user_id: u,
                    } = ev
                    {
                        if m == meeting_id && u == user_id {
                            let _ = tx.send(event.clone());
                            break;
                        }
                    }
                }
            }));
        }

        let mut disconnects = self.ctx.mcs.disconnect_events();
        let tx = self.ctx.events_tx.clone();
        let event = SessionEvent::server_offline(
            self.key.clone(),
            self.descriptor.connection_id.clone(),
            self.descriptor.key.resource_id.clone(),
            self.descriptor.key.role,
        );
        watchers.push(tokio::spawn(async move {
            if disconnects.recv().await.is_some() {
                let _ = tx.send(event);
            }
        }));

        *self.watchers.lock() = watchers;
    }

    fn endpoint_params(&self) -> EndpointParams {
        EndpointParams {
            media_type: self.descriptor.media_type,
            key: self.key.clone(),
            user_id: self.descriptor.key.user_id.clone(),
            connection_id: self.descriptor.connection_id.clone(),
            meeting_id: self.descriptor.meeting_id.clone(),
            voice_bridge: self.descriptor.voice_bridge.clone(),
            resource_id: self.descriptor.key.resource_id.clone(),
            role: self.descriptor.key.role,
            media_server: self.descriptor.media_server.clone(),
            media_spec: self.descriptor.media_spec.clone(),
            record: self.descriptor.record,
            source_stream: self.descriptor.source_stream.clone(),
            mcs: self.ctx.mcs.clone(),
            bus: self.ctx.bus.clone(),
            bridges: self.ctx.bridges.clone(),
            events_tx: self.ctx.events_tx.clone(),
            ice_queue: self.ice_queue.clone(),
            flow_timeout: self.ctx.config.media_flow_timeout(),
            state_timeout: self.ctx.config.media_state_timeout(),
        }
    }

    /// Build and negotiate the endpoint for this session's role. The
    /// endpoint slot is held for the whole negotiation so a candidate
    /// arriving right after the ICE flush waits for the endpoint instead
    /// of finding an empty slot. On failure, partial allocations are torn
    /// down before the error is re-raised.
    pub async fn start(&self, offer: Option<&str>) -> Result<String> {
        let params = self.endpoint_params();
        let mut slot = self.endpoint.lock().await;
        let endpoint = slot.insert(if self.descriptor.key.role.is_publisher() {
            Endpoint::Publisher(PublisherEndpoint::new(params))
        } else {
            Endpoint::Consumer(ConsumerEndpoint::new(params))
        });

        match endpoint.start(offer).await {
            Ok(answer) => {
                drop(slot);
                self.set_status(SessionStatus::Started);
                Ok(answer)
            }
            Err(e) => {
                let failed = slot.take();
                drop(slot);
                if let Some(endpoint) = failed {
                    endpoint.stop().await;
                }
                Err(e)
            }
        }
    }

    /// Buffered until the endpoint reports readiness, then forwarded in
    /// arrival order.
    pub async fn on_ice_candidate(&self, candidate: &Value) -> Result<()> {
        {
            let mut queue = self.ice_queue.lock().await;
            if !queue.is_flushed() {
                queue.push(candidate.clone());
                return Ok(());
            }
        }
        let endpoint = self.endpoint.lock().await;
        match endpoint.as_ref() {
            Some(endpoint) => endpoint.on_ice_candidate(candidate).await,
            None => Ok(()),
        }
    }

    pub async fn process_answer(&self, descriptor: &str) -> Result<()> {
        let endpoint = self.endpoint.lock().await;
        match endpoint.as_ref() {
            Some(endpoint) => endpoint.process_answer(descriptor).await,
            None => Ok(()),
        }
    }

    pub async fn dtmf(&self, tones: &str) -> Result<String> {
        let endpoint = self.endpoint.lock().await;
        match endpoint.as_ref() {
            Some(endpoint) => endpoint.dtmf(tones).await,
            None => Ok(String::new()),
        }
    }

    pub async fn restart_ice(&self) -> Result<Option<String>> {
        let endpoint = self.endpoint.lock().await;
        match endpoint.as_ref() {
            Some(endpoint) => endpoint.restart_ice().await,
            None => Ok(None),
        }
    }

    /// Idempotent teardown: detach the event watchers, stop the endpoint
    /// if one exists, clear the slot.
    pub async fn stop(&self) {
        {
            let mut status = self.status.lock();
            if matches!(*status, SessionStatus::Stopping | SessionStatus::Stopped) {
                return;
            }
            *status = SessionStatus::Stopping;
        }

        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }

        let endpoint = self.endpoint.lock().await.take();
        if let Some(endpoint) = endpoint {
            endpoint.stop().await;
        }

        self.set_status(SessionStatus::Stopped);
        tracing::info!("Session {} stopped", self.key);
    }
}
