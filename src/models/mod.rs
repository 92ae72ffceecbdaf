//! Domain entities shared across components.

pub mod diagram;
pub mod session;
