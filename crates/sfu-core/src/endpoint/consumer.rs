//! Consumer endpoint
//!
//! Receive-only media session fed from the meeting's shared consumer
//! bridge.

use super::{spawn_media_listener, EndpointParams, Watchdog};
use crate::errors::{Result, SfuError};
use crate::mcs::{JoinOptions, SubscribeOptions};
use crate::types::MediaType;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct NegotiatedIds {
    mcs_user_id: Option<String>,
    media_id: Option<String>,
}

pub struct ConsumerEndpoint {
    params: EndpointParams,
    ids: Mutex<NegotiatedIds>,
    flow_watchdog: Arc<Watchdog>,
    state_watchdog: Arc<Watchdog>,
    listener: Mutex<Option<JoinHandle<()>>>,
    bridge_held: AtomicBool,
}

impl ConsumerEndpoint {
    pub(crate) fn new(params: EndpointParams) -> Self {
        Self {
            params,
            ids: Mutex::new(NegotiatedIds::default()),
            flow_watchdog: Watchdog::new(),
            state_watchdog: Watchdog::new(),
            listener: Mutex::new(None),
            bridge_held: AtomicBool::new(false),
        }
    }

    pub fn media_id(&self) -> Option<String> {
        self.ids.lock().media_id.clone()
    }

    fn room(&self) -> &str {
        match self.params.media_type {
            MediaType::Audio => &self.params.voice_bridge,
            MediaType::Video => &self.params.meeting_id,
        }
    }

    pub async fn start(&self, offer: Option<&str>) -> Result<String> {
        let p = &self.params;
        if !p.mcs.wait_for_connection().await {
            return Err(SfuError::MediaServerOffline);
        }

        let mcs_user_id = p
            .mcs
            .join(
                self.room(),
                "SFU",
                JoinOptions {
                    external_user_id: p.user_id.clone(),
                    auto_leave: true,
                },
            )
            .await?;

        let bridge = p
            .bridges
            .acquire(&p.meeting_id, &p.voice_bridge, &p.media_server, p.mcs.clone())
            .await?;
        self.bridge_held.store(true, Ordering::SeqCst);
        let source = bridge
            .media_id()
            .await
            .ok_or_else(|| SfuError::negotiation_failed("consumer bridge has no media id"))?;

        let negotiated = p
            .mcs
            .subscribe(
                &mcs_user_id,
                &source,
                p.media_type,
                SubscribeOptions {
                    sdp_offer: offer.map(str::to_string),
                    adapter: p.media_server.clone(),
                    media_specs: Some(p.media_spec.clone()),
                },
            )
            .await?;
        let media_id = negotiated.media_id.clone();

        {
            let mut ids = self.ids.lock();
            ids.mcs_user_id = Some(mcs_user_id);
            ids.media_id = Some(media_id.clone());
        }

        let events = p.mcs.media_events(&media_id);
        *self.listener.lock() = Some(spawn_media_listener(
            p.clone(),
            self.flow_watchdog.clone(),
            self.state_watchdog.clone(),
            events,
        ));

        self.flush_candidates(&media_id).await?;

        tracing::info!("Consumer endpoint started for {}", p.key);
        Ok(negotiated.sdp_answer)
    }

    async fn flush_candidates(&self, media_id: &str) -> Result<()> {
        let mut queue = self.params.ice_queue.lock().await;
        let pending = queue.take_pending();
        if !pending.is_empty() {
            tracing::debug!(
                "Flushing {} buffered candidates for {}",
                pending.len(),
                self.params.key
            );
        }
        for candidate in &pending {
            self.params.mcs.add_ice_candidate(media_id, candidate).await?;
        }
        Ok(())
    }

    pub async fn on_ice_candidate(&self, candidate: &Value) -> Result<()> {
        let mut queue = self.params.ice_queue.lock().await;
        if !queue.is_flushed() {
            queue.push(candidate.clone());
            return Ok(());
        }
        let media_id = self
            .media_id()
            .ok_or_else(|| SfuError::negotiation_failed("endpoint has no media id"))?;
        self.params.mcs.add_ice_candidate(&media_id, candidate).await
    }

    /// Deliver the subscriber's answer for the negotiated media. Without
    /// a media id this resolves without side effects.
    pub async fn process_answer(&self, descriptor: &str) -> Result<()> {
        match self.media_id() {
            Some(media_id) => self.params.mcs.process_answer(&media_id, descriptor).await,
            None => Ok(()),
        }
    }

    pub async fn stop(&self) {
        self.flow_watchdog.clear();
        self.state_watchdog.clear();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.params.ice_queue.lock().await.clear();

        let (user, media) = {
            let mut ids = self.ids.lock();
            (ids.mcs_user_id.take(), ids.media_id.take())
        };
        if let (Some(user), Some(media)) = (user, media) {
            if let Err(e) = self.params.mcs.unpublish(&user, &media).await {
                tracing::warn!("Unsubscribe failed for {}: {}", self.params.key, e);
            }
        }

        if self.bridge_held.swap(false, Ordering::SeqCst) {
            self.params.bridges.release(&self.params.meeting_id).await;
        }
    }
}
