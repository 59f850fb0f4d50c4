//! Instrumentation port.

/// Which distribution path produced a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryPath {
    /// Periodic exchange-keyed pass.
    Exchange,
    /// Periodic instrument-keyed pass.
    Instrument,
    /// Immediate push outside the cycle.
    OnDemand,
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Explicit logout.
    Logout,
    /// Replaced by a newer login of the same client.
    Superseded,
    /// Idle past the timeout.
    Expired,
}

/// Counters the fan-out engine and the command surface report into.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceMetrics: Send + Sync {
    /// One delivery attempt finished.
    fn delivery(&self, path: DeliveryPath, success: bool);

    /// A group's assembly or delivery was abandoned.
    fn group_failed(&self, path: DeliveryPath);

    /// A login created a session.
    fn session_created(&self);

    /// Sessions left the registry.
    fn sessions_removed(&self, reason: RemovalReason, count: u64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ServiceMetrics for NoopMetrics {
    fn delivery(&self, _path: DeliveryPath, _success: bool) {}

    fn group_failed(&self, _path: DeliveryPath) {}

    fn session_created(&self) {}

    fn sessions_removed(&self, _reason: RemovalReason, _count: u64) {}
}
