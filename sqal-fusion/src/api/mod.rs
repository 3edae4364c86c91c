//! HTTP API handlers for sqal-fusion
//!
//! Inbound frames over REST and WebSocket, outbound results over WebSocket
//! and SSE, plus sample operations and service health.

pub mod events;
pub mod frames;
pub mod health;
pub mod results;
pub mod samples;

pub use events::event_stream;
pub use frames::frame_routes;
pub use health::health_routes;
pub use results::result_routes;
pub use samples::sample_routes;
