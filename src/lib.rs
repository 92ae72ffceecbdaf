#![forbid(unsafe_code)]

//! Session supervision and event streaming engine.
//!
//! Supervises a single long-lived agent worker, exposing its lifecycle
//! and output as a reliable, observable, resumable event stream: bounded
//! backed-off restarts on crashes, independent liveness probing, ordered
//! fan-out to any number of subscribers, durable resume records, and a
//! bounded repair loop for diagram artifacts the worker produces.

pub mod bus;
pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod repair;
pub mod supervisor;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
