//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the fan-out engine, the session command surface
//! and the port interfaces they deliver through.

/// Port interfaces for outbound delivery.
pub mod ports;

/// Fan-out and command services.
pub mod services;
