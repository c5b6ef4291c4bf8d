//! housetime: a small-footprint stratum-1 GPS/NTP daemon.
//!
//! Two binaries sit on top of this crate: `housetimed` (the Time process,
//! src/bin/time.rs) and `housetime-status` (the Status process,
//! src/bin/statusd.rs). Everything else lives here so both binaries share
//! the same wire codec, shared-memory layout and configuration parsing.

pub mod clock;
pub mod clock_discipline;
pub mod config;
pub mod net_io;
pub mod nmea;
pub mod ntp_engine;
pub mod packet;
pub mod security;
pub mod serial_link;
pub mod shared;
pub mod status;
pub mod supervisor;
