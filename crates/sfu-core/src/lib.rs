//! # SFU Session-Management Core
//!
//! Mediates between WebRTC client peers on a conferencing message bus
//! and an external Media Control Server that owns the RTP endpoints.
//! For each client request the core authorizes it against meeting state,
//! allocates or reuses a server-side media session, negotiates SDP with
//! the MCS, bridges the session to the per-meeting consumer fabric and
//! drives it through its lifecycle: ICE trickling, media watchdogs,
//! media-server outages and client disconnection.
//!
//! The embedder supplies the transport-facing collaborators
//! ([`mcs::McsGateway`], [`bus::BusGateway`], [`permissions::PermissionOracle`])
//! and one [`manager::Manager`] per media type.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod manager;
pub mod mcs;
pub mod messages;
pub mod metrics;
pub mod permissions;
pub mod session;
pub mod sources;
pub mod types;

pub use bridge::{Bridge, BridgeRegistry, BridgeState};
pub use bus::{BusGateway, MeetingEvent, MeetingEventStream};
pub use config::SfuConfig;
pub use endpoint::{Endpoint, IceQueue};
pub use errors::{Result, SfuError};
pub use manager::Manager;
pub use mcs::{
    DisconnectStream, FlowDirection, JoinOptions, McsEvent, McsGateway, MediaEventStream,
    NegotiatedMedia, PublishOptions, SubscribeOptions,
};
pub use messages::{ClientFrame, Envelope, ErrorBody, HeaderOutcome, UserInfoHeader};
pub use metrics::SfuMetrics;
pub use permissions::PermissionOracle;
pub use session::{Session, SessionEvent};
pub use sources::{SourceRegistry, EXTERNAL_SOURCE_PREFIX};
pub use types::{MediaSpec, MediaType, Role, SessionKey, SessionStatus};
