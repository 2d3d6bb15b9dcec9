//! Availability search and double-booking-safe reservations over a set of
//! business schedules.

pub mod availability;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod flow;
pub mod gate;
pub mod limits;
pub mod model;
pub mod node;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod token;
pub mod wal;
