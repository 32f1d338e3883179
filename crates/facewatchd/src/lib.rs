//! facewatch daemon library: per-camera workers, the shared inference pool,
//! stream encoding and the D-Bus control surface.

pub mod annotate;
pub mod config;
pub mod dbus_interface;
pub mod encoder;
pub mod identity;
pub mod match_log;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod worker;
