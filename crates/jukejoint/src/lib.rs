//! Jukejoint server library.
//!
//! The binary in `main.rs` wires these modules together; they are exposed
//! as a library so the integration tests can assemble the same runtime
//! with fake collaborators.

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod endpoints;
pub mod media;
pub mod pipeline;
pub mod room;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod web;
