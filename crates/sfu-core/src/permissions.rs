//! Permission oracle
//!
//! Boolean authorization queries against meeting state. The manager maps
//! a deny to the catalogue's permission error before anything is stored.

use crate::errors::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PermissionOracle: Send + Sync {
    /// May this user broadcast the given camera?
    async fn can_broadcast(
        &self,
        user_id: &str,
        meeting_id: &str,
        camera_id: &str,
    ) -> Result<bool>;

    /// May this user subscribe to the given camera?
    async fn can_subscribe(
        &self,
        user_id: &str,
        meeting_id: &str,
        camera_id: &str,
    ) -> Result<bool>;

    /// May this user speak (or listen) on the given voice bridge?
    async fn can_speak(
        &self,
        user_id: &str,
        meeting_id: &str,
        voice_bridge: &str,
    ) -> Result<bool>;
}
