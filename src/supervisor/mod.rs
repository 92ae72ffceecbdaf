//! Session supervision: state machine, restart policy, liveness probing.

pub mod health_monitor;
pub mod restart_policy;
pub mod session;
