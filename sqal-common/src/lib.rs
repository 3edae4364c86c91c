//! # SQAL Common Library
//!
//! Shared code for the SQAL quality-control services including:
//! - Sensor frame, analysis and fusion result types
//! - Service event types (SqalEvent enum) and the EventBus
//! - TOML bootstrap configuration loading
//! - Common error type

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{Error, Result};
pub use types::{Grade, Modality, SampleId};
