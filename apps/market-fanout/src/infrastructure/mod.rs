//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the runtime plumbing around them.

/// Topic-addressed broadcast channels implementing the transport port.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Tick feed ingestion and the simulated feed.
pub mod feed;

/// Health, statistics and metrics HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Periodic background task runner.
pub mod scheduler;

/// OpenTelemetry tracing integration.
pub mod telemetry;
