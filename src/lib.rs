//! skymux - consolidates ADS-B bundles from edge receivers
//!
//! Pulls bundled surveillance messages off a message bus, dedupes them
//! across receivers, groups them into per-aircraft track fragments, and
//! ships the fragments to a storage sink while keeping a live "current
//! sky" snapshot published to a shared cache.

pub mod admin;
pub mod airspace;
pub mod bundle;
pub mod commands;
pub mod dedup;
pub mod dispatcher;
pub mod message;
pub mod puller;
pub mod reference;
pub mod sink;
pub mod snapshot;
pub mod track_buffer;
pub mod tuning;
pub mod vitals;
pub mod workers;

pub use airspace::{Airspace, AircraftData, SkySnapshot};
pub use message::{CompositeMessage, DataSource, IcaoId, Position, Signature};
pub use track_buffer::{Fragment, TrackBuffer};
