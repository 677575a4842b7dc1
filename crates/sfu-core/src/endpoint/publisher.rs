//! Publisher/transceiver endpoint
//!
//! Bidirectional media session: owns a media id on the MCS and, for
//! audio, a private bridge to the softswitch.

use super::{spawn_media_listener, EndpointParams, Watchdog};
use crate::bridge::Bridge;
use crate::errors::{Result, SfuError};
use crate::mcs::{JoinOptions, PublishOptions};
use crate::types::MediaType;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct NegotiatedIds {
    mcs_user_id: Option<String>,
    media_id: Option<String>,
}

pub struct PublisherEndpoint {
    params: EndpointParams,
    ids: Mutex<NegotiatedIds>,
    flow_watchdog: Arc<Watchdog>,
    state_watchdog: Arc<Watchdog>,
    listener: Mutex<Option<JoinHandle<()>>>,
    bridge: Mutex<Option<Arc<Bridge>>>,
}

impl PublisherEndpoint {
    pub(crate) fn new(params: EndpointParams) -> Self {
        Self {
            params,
            ids: Mutex::new(NegotiatedIds::default()),
            flow_watchdog: Watchdog::new(),
            state_watchdog: Watchdog::new(),
            listener: Mutex::new(None),
            bridge: Mutex::new(None),
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

    fn publish_options(&self, offer: Option<&str>) -> PublishOptions {
        PublishOptions {
            sdp_offer: offer.map(str::to_string),
            adapter: self.params.media_server.clone(),
            media_specs: Some(self.params.media_spec.clone()),
            rtp_header_extensions: Vec::new(),
            override_router_codecs: false,
            dedicated_router: false,
            record: self.params.record,
            stream_name: self.params.source_stream.clone(),
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

        let negotiated = p
            .mcs
            .publish(
                &mcs_user_id,
                self.room(),
                p.media_type,
                self.publish_options(offer),
            )
            .await?;
        let media_id = negotiated.media_id.clone();

        {
            let mut ids = self.ids.lock();
            ids.mcs_user_id = Some(mcs_user_id);
            ids.media_id = Some(media_id.clone());
        }

        // Audio publishers get a softswitch leg; the client's answer then
        // comes out of the consume, not the publish.
        let answer = match p.media_type {
            MediaType::Video => negotiated.sdp_answer,
            MediaType::Audio => {
                let bridge = Arc::new(Bridge::new(
                    p.meeting_id.clone(),
                    p.voice_bridge.clone(),
                    p.media_server.clone(),
                    p.mcs.clone(),
                ));
                bridge.start().await?;
                let bridge_media = bridge
                    .media_id()
                    .await
                    .ok_or_else(|| SfuError::negotiation_failed("bridge has no media id"))?;
                *self.bridge.lock() = Some(bridge);

                let answer = p
                    .mcs
                    .consume(&bridge_media, &media_id, MediaType::Audio)
                    .await?;
                p.mcs
                    .connect(&media_id, &bridge_media, MediaType::Audio)
                    .await?;
                p.mcs
                    .connect(&bridge_media, &media_id, MediaType::Audio)
                    .await?;
                answer
            }
        };

        let events = p.mcs.media_events(&media_id);
        *self.listener.lock() = Some(spawn_media_listener(
            p.clone(),
            self.flow_watchdog.clone(),
            self.state_watchdog.clone(),
            events,
        ));

        self.flush_candidates(&media_id).await?;

        tracing::info!("Publisher endpoint started for {}", p.key);
        Ok(answer)
    }

    /// Forward buffered client candidates in arrival order, then switch
    /// the queue to pass-through.
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

    /// Renegotiation with a fresh descriptor. The previous media id is
    /// reused by the MCS; without one this is a no-op.
    pub async fn process_answer(&self, descriptor: &str) -> Result<()> {
        let mcs_user_id = match self.ids.lock().mcs_user_id.clone() {
            Some(id) => id,
            None => return Ok(()),
        };
        self.params
            .mcs
            .publish(
                &mcs_user_id,
                self.room(),
                self.params.media_type,
                self.publish_options(Some(descriptor)),
            )
            .await?;
        Ok(())
    }

    pub async fn dtmf(&self, tones: &str) -> Result<String> {
        if self.params.media_type != MediaType::Audio {
            return Ok(String::new());
        }
        match self.media_id() {
            Some(media_id) => self.params.mcs.dtmf(&media_id, tones).await,
            None => Ok(String::new()),
        }
    }

    pub async fn restart_ice(&self) -> Result<Option<String>> {
        match self.media_id() {
            Some(media_id) => Ok(Some(self.params.mcs.restart_ice(&media_id).await?)),
            None => Ok(None),
        }
    }

    /// Tear down: timers, listener, buffered candidates, the MCS media
    /// (best-effort) and the softswitch leg.
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
                tracing::warn!("Unpublish failed for {}: {}", self.params.key, e);
            }
        }

        let bridge = self.bridge.lock().take();
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
    }
}
