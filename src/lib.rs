//! NTRIP caster: a single-reactor TCP server multiplexing NTRIP publishers
//! (GNSS base stations) and subscribers (rovers), maintaining a source
//! table and an `auto` nearest-mount pseudo-mount-point.
//!
//! The crate is organized leaves-first, mirroring the components this
//! caster is built from:
//! - [`codec`] — stateless Base64, NMEA GGA, `Position:` header, and
//!   Haversine-distance helpers.
//! - [`registry`] — the authoritative in-memory mount-point table.
//! - [`handshake`] — stateless classification of the first message on an
//!   accepted socket.
//! - [`reactor`] — the fan-out forwarder and the reactor loop that drives
//!   everything else.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod reactor;
pub mod registry;

pub use config::CasterConfig;
pub use error::CasterError;
pub use reactor::{Caster, CasterHandle};
