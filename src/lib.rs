//! Telematics ingestion gateway for Teltonika OBD trackers.
//!
//! The gateway accepts long-lived TCP connections from FMC003-class
//! devices, authenticates each one against an operator-maintained IMEI
//! allow-list, decodes Codec 8 / Codec 8E AVL frames, persists raw and
//! normalized records per device type, and serves a read-only HTTP API
//! that synthesizes trips, daily summaries, and a driver-behavior score
//! on demand.
//!
//! Module map, leaves first:
//! - [`codec`]: bytes to decoded packets, stateless and bounds-checked
//! - [`normalizer`]: IO ids to stable semantic field names
//! - [`session`]: per-connection state machine and framing, socket-free
//! - [`analyzer`]: trip segmentation and behavior scoring
//! - [`database`]: document-collection store over SQLite
//! - [`tcp`] / [`http`]: the two listeners
//! - [`rawlog`]: hourly raw frame capture files

pub mod analyzer;
pub mod codec;
pub mod config;
pub mod database;
pub mod errors;
pub mod http;
pub mod models;
pub mod normalizer;
pub mod rawlog;
pub mod session;
pub mod tcp;

pub use config::AppConfig;
pub use database::{Db, DbBuilder, DbDropGuard};
pub use errors::AvlRecorderError;
pub use models::{Device, Imei, Record};
