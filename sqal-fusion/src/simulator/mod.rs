//! Frame simulator
//!
//! Synthesizes or replays sensor frames and feeds them to a pipeline, either
//! in-process or through a running server's HTTP API. Used by the `sqal-sim`
//! binary and by the end-to-end tests.

pub mod generator;
pub mod recording;
pub mod sink;

pub use generator::{FrameGenerator, QualityProfile};
pub use sink::{FrameSink, SendOutcome};

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use serde::Serialize;
use sqal_common::types::FramePayload;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Simulator failures
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recording line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize frame failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
}

/// Totals for one replay run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub fused: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Paces frame submission to a fixed throughput
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl Throttle {
    pub fn per_second(frames_per_second: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(frames_per_second)),
        }
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }
}

/// Send frames through `sink`, at most `frames_per_second`
///
/// Rejected frames are counted, not treated as errors; transport failures
/// abort the run.
pub async fn replay<I>(
    frames: I,
    sink: &FrameSink,
    frames_per_second: NonZeroU32,
) -> Result<ReplaySummary, SimulatorError>
where
    I: IntoIterator<Item = FramePayload>,
{
    let throttle = Throttle::per_second(frames_per_second);
    let started = Instant::now();
    let mut summary = ReplaySummary::default();

    for payload in frames {
        throttle.wait().await;
        summary.sent += 1;
        match sink.send(&payload).await? {
            SendOutcome::Accepted { fused } => {
                summary.accepted += 1;
                if fused {
                    summary.fused += 1;
                }
            }
            SendOutcome::Rejected(reason) => {
                summary.rejected += 1;
                warn!("Frame for sample {} rejected: {}", payload.sample_id(), reason);
            }
        }
        if summary.sent % 100 == 0 {
            debug!("Replayed {} frames", summary.sent);
        }
    }

    summary.elapsed = started.elapsed();
    info!(
        "Replay finished: {} sent, {} accepted, {} rejected, {} samples fused in {:.2?}",
        summary.sent, summary.accepted, summary.rejected, summary.fused, summary.elapsed
    );
    Ok(summary)
}
