//! Operation State: which kind of connector call is in flight right now, so
//! the Pipeline Engine knows which `recv_*_cont` to call when a watcher
//! fires. The connector's own internal `Op` enum (private to
//! [`crate::connector`]) tracks the wire-level phase; this one is the
//! outward-facing mirror the rest of the core dispatches on.

/// What the connector is currently doing. `Idle` is the only state from
/// which the Pipeline Engine may start a new operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Connecting,
    /// Flushing a write; `send_cont` resumes it.
    Sending,
    ReceivingQuery,
    ReceivingPrepare,
    ReceivingUnit,
}

impl OperationState {
    pub fn is_idle(self) -> bool {
        matches!(self, OperationState::Idle)
    }

    /// Statement-scope, ping, change-user, select-db, reset-connection, and
    /// prepare calls may not start while this is true — only plain queries
    /// may be queued behind an in-flight operation.
    pub fn exclusive_op_in_flight(self) -> bool {
        !self.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_is_idle() {
        assert!(OperationState::Idle.is_idle());
        for busy in [
            OperationState::Connecting,
            OperationState::Sending,
            OperationState::ReceivingQuery,
            OperationState::ReceivingPrepare,
            OperationState::ReceivingUnit,
        ] {
            assert!(!busy.is_idle());
            assert!(busy.exclusive_op_in_flight());
        }
        assert!(!OperationState::Idle.exclusive_op_in_flight());
    }
}
