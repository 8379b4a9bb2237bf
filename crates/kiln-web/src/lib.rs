//! Kiln web crate.
//!
//! Everything that talks to the outside of a [`kiln_core::FormSession`]:
//! the document/save/unlock HTTP client, the external state bridge that
//! host scripts observe and drive, and the live template sync over a
//! Pusher-protocol websocket.

pub mod accessor;
pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod sync;
pub mod transport;

pub use accessor::{
    SessionAccessor, SharedSession, attach_session, mirror_changes, register_fields, render_and_mirror,
    share,
};
pub use api::{Credential, FormApi, SaveIdentity, SaveOutcome};
pub use bridge::{Bridge, FieldAccessor, FieldRef, FieldRefs, RegistrationStatus, SubscriptionId};
pub use config::{BridgeConfig, KilnConfig, ReverbConfig, SyncConfig};
pub use error::{ApiError, ConfigError, SyncError};
pub use kiln_core::{EvalError, EvalResult};
pub use sync::{ConnectionStatus, DocumentSource, LiveSync, SyncHandle, channel_name};
pub use transport::{PusherMessage, TransportCommand, TransportEvent, TransportHandle, spawn_pusher};
