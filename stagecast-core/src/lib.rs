//! Stagecast core
//!
//! In-memory orchestration of real-time stages: the participant registry,
//! per-participant SFU resource lifecycles, and the broadcast protocol that
//! keeps every connected client's view of a stage consistent.
//!
//! External collaborators (identity verification, stage persistence, the SFU
//! engine itself) are reached through traits; this crate ships in-memory and
//! in-process implementations that stand in for them in development and tests.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;
pub mod sfu;

pub use config::Config;
pub use error::{Error, Result};
