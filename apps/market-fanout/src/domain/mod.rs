//! Domain Layer - Market state and client sessions.
//!
//! Pure in-process state with no I/O: the snapshot cache, the session
//! registry and the types they share. Time is read through the
//! [`clock::Clock`] port.

/// Wall-clock port.
pub mod clock;

/// Tick and snapshot types.
pub mod market;

/// Per-instrument snapshot cache.
pub mod cache;

/// Sessions and the session registry.
pub mod session;
