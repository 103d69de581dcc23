//! # Connection Manager
//!
//! Maintains at most one authenticated WebSocket session to Home Assistant
//! at a time, drawn from a prioritized endpoint set
//! `[primary, cloud_fallback, local_fallback]`. Each endpoint is guarded by
//! a circuit breaker; an endpoint whose breaker is Open is skipped until its
//! reset timeout elapses.
//!
//! This crate owns only the connection. No event data is buffered here; any
//! I/O error on a live session is fatal to that session and the caller must
//! discard it and re-acquire.

pub mod breaker;
pub mod frames;
pub mod manager;
pub mod metrics;
pub mod session;

pub use breaker::{BreakerState, CircuitBreaker};
pub use frames::ServerFrame;
pub use manager::{AcquireError, ConnectionManager, ReportOutcome};
pub use session::{ConnectError, SessionError, SessionHandle};
