//! Ephemeral Signals
//!
//! Short-lived, location-tagged posts that travel over the mesh, the cloud
//! relay, or both. [`SignalSyncEngine`] owns the feed; the other modules are
//! the pieces it is built from.

pub mod codec;
pub mod engine;
pub mod feed;
pub mod policy;
pub mod types;

pub use engine::{
    CleanupReport, EngineDeps, Exclusion, ExclusionReason, MeshIngest, RefreshOutcome,
    SignalSyncEngine, SignalSyncHandle, TickReport,
};
pub use feed::{
    feed_order, FeedEntry, FeedLoadState, FeedSnapshot, SignalFeedState, SignalPhase, Upsert,
};
pub use policy::SignalPolicy;
pub use types::{
    AuthorRef, CoarseLocation, LocalMedia, MediaRef, MediaState, NewSignal, Signal, SignalKind,
    SignalOrigin,
};
