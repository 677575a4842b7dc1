//! Softswitch bridge and the per-meeting bridge registry
//!
//! A `Bridge` is the softswitch-side media endpoint that connects the SFU
//! to the legacy conference mixer. Audio publishers own a private bridge;
//! consumer sessions of a meeting share one through the refcounted
//! registry.

use crate::errors::{Result, SfuError};
use crate::mcs::{JoinOptions, McsGateway, PublishOptions};
use crate::types::MediaType;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Running,
    /// A start attempt failed; waiters share the failure instead of
    /// re-dialing the MCS. The registry replaces a failed bridge once its
    /// wave of holders has drained.
    Failed,
    Stopped,
}

#[derive(Debug)]
struct BridgeInner {
    state: BridgeState,
    failure: Option<String>,
    mcs_user_id: Option<String>,
    media_id: Option<String>,
}

/// One softswitch-side endpoint for a voice bridge.
pub struct Bridge {
    meeting_id: String,
    voice_bridge: String,
    media_server: String,
    mcs: Arc<dyn McsGateway>,
    // The lock is held across the whole start negotiation, which is what
    // gives concurrent callers single-flight semantics.
    inner: Mutex<BridgeInner>,
}

impl Bridge {
    pub fn new(
        meeting_id: impl Into<String>,
        voice_bridge: impl Into<String>,
        media_server: impl Into<String>,
        mcs: Arc<dyn McsGateway>,
    ) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            voice_bridge: voice_bridge.into(),
            media_server: media_server.into(),
            mcs,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Idle,
                failure: None,
                mcs_user_id: None,
                media_id: None,
            }),
        }
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub async fn state(&self) -> BridgeState {
        self.inner.lock().await.state
    }

    /// The bridge's media id on the MCS, available once running.
    pub async fn media_id(&self) -> Option<String> {
        self.inner.lock().await.media_id.clone()
    }

    /// Start the softswitch leg. Idempotent while running; concurrent
    /// callers await the in-flight negotiation and share its outcome.
    /// A failed attempt latches, so waiters queued behind it observe the
    /// same error rather than re-running the RPC sequence themselves.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BridgeState::Running => return Ok(()),
            BridgeState::Failed => {
                let reason = inner
                    .failure
                    .clone()
                    .unwrap_or_else(|| "bridge start failed".to_string());
                return Err(SfuError::bridge_failed(reason));
            }
            BridgeState::Stopped => {
                return Err(SfuError::bridge_failed(format!(
                    "bridge for meeting {} already stopped",
                    self.meeting_id
                )));
            }
            BridgeState::Idle | BridgeState::Starting => {}
        }
        inner.state = BridgeState::Starting;

        let join = self
            .mcs
            .join(
                &self.voice_bridge,
                "SFU",
                JoinOptions {
                    external_user_id: self.meeting_id.clone(),
                    auto_leave: true,
                },
            )
            .await;
        let mcs_user_id = match join {
            Ok(id) => id,
            Err(e) => {
                inner.state = BridgeState::Failed;
                inner.failure = Some(e.to_string());
                return Err(e);
            }
        };

        let publish = self
            .mcs
            .publish(
                &mcs_user_id,
                &self.voice_bridge,
                MediaType::Audio,
                PublishOptions {
                    adapter: self.media_server.clone(),
                    record: false,
                    ..PublishOptions::default()
                },
            )
            .await;
        let negotiated = match publish {
            Ok(negotiated) => negotiated,
            Err(e) => {
                inner.state = BridgeState::Failed;
                inner.failure = Some(e.to_string());
                return Err(e);
            }
        };

        tracing::info!(
            "Bridge for meeting {} running on voice bridge {} (media {})",
            self.meeting_id,
            self.voice_bridge,
            negotiated.media_id
        );

        inner.mcs_user_id = Some(mcs_user_id);
        inner.media_id = Some(negotiated.media_id);
        inner.state = BridgeState::Running;
        Ok(())
    }

    /// Stop the softswitch leg. Best-effort; failures are logged.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BridgeState::Stopped {
            return;
        }
        inner.state = BridgeState::Stopped;
        let user = inner.mcs_user_id.take();
        let media = inner.media_id.take();
        drop(inner);

        if let (Some(user), Some(media)) = (user, media) {
            if let Err(e) = self.mcs.unpublish(&user, &media).await {
                tracing::warn!(
                    "Failed to unpublish bridge media for meeting {}: {}",
                    self.meeting_id,
                    e
                );
            }
        }
        tracing::info!("Stopped bridge for meeting {}", self.meeting_id);
    }
}

struct BridgeEntry {
    bridge: Arc<Bridge>,
    refs: usize,
}

/// Process-wide map from meeting id to its shared consumer bridge.
pub struct BridgeRegistry {
    bridges: DashMap<String, BridgeEntry>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self {
            bridges: DashMap::new(),
        }
    }

    /// Number of live bridges.
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Current refcount of a meeting's bridge.
    pub fn refcount(&self, meeting_id: &str) -> usize {
        self.bridges.get(meeting_id).map(|e| e.refs).unwrap_or(0)
    }

    /// Acquire the meeting's shared bridge, starting it when absent.
    /// Concurrent acquires for the same meeting observe a single start:
    /// one caller negotiates, everyone else shares the outcome. When the
    /// attempt fails, the whole wave gets the same error and the final
    /// release drops the failed bridge, so only a later acquire dials the
    /// MCS again.
    pub async fn acquire(
        &self,
        meeting_id: &str,
        voice_bridge: &str,
        media_server: &str,
        mcs: Arc<dyn McsGateway>,
    ) -> Result<Arc<Bridge>> {
        // Two rounds: a bridge observed in Stopped (a racing release won)
        // is replaced with a fresh one.
        for _ in 0..2 {
            let bridge = {
                let mut entry = self
                    .bridges
                    .entry(meeting_id.to_string())
                    .or_insert_with(|| BridgeEntry {
                        bridge: Arc::new(Bridge::new(
                            meeting_id,
                            voice_bridge,
                            media_server,
                            mcs.clone(),
                        )),
                        refs: 0,
                    });
                entry.refs += 1;
                entry.bridge.clone()
            };

            match bridge.start().await {
                Ok(()) => return Ok(bridge),
                Err(e) => {
                    // A bridge already Stopped before our release lost a
                    // race with the last holder; retry with a fresh one.
                    let lost_race = bridge.state().await == BridgeState::Stopped;
                    self.release(meeting_id).await;
                    if lost_race {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(SfuError::bridge_failed(format!(
            "bridge for meeting {} kept stopping during acquire",
            meeting_id
        )))
    }

    /// Release one hold on the meeting's bridge; the last release stops
    /// and removes it. Releasing an absent meeting is a no-op, so the
    /// refcount can never go negative.
    pub async fn release(&self, meeting_id: &str) {
        match self.bridges.get_mut(meeting_id) {
            None => {
                tracing::warn!("Release for unknown bridge {}", meeting_id);
                return;
            }
            Some(mut entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs > 0 {
                    return;
                }
            }
        }
        // Remove only if still unreferenced; a concurrent acquire between
        // the decrement and here keeps the bridge alive.
        let removed = self.bridges.remove_if(meeting_id, |_, entry| entry.refs == 0);
        if let Some((_, entry)) = removed {
            entry.bridge.stop().await;
        }
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
