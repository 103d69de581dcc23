//! Daemon wiring: the session supervisor and the read-side HTTP API.
//!
//! `main.rs` assembles the components from these modules.

pub mod api;
pub mod supervisor;
