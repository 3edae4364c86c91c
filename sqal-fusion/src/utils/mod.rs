//! Utility modules for sqal-fusion

pub mod sync;

pub use sync::lock;
