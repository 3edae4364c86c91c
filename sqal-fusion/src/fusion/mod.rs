//! Fusion engine
//!
//! Joins per-modality analyses on `sample_id` and fuses them into one graded
//! [`FusionResult`].
//!
//! **Per-sample state machine:**
//! ```text
//! WAITING ──all expected arrived──────▶ FUSED
//!    │    ──wait expired, ≥1 analysis─▶ FUSED (partial)
//!    │    ──wait expired, 0 analyses──▶ DISCARDED (NoData)
//!    └────cancel──────────────────────▶ CANCELLED
//! ```
//!
//! **Locking:** the pending table lock is held only to look up or insert a
//! per-sample record; every record has its own mutex, so unrelated samples
//! never wait on each other. Lock order is record → fuse clock → table → log;
//! the table lock is never held while taking a record lock.
//!
//! **Ordering:** the fuse clock is the one point where samples serialize.
//! `fused_at` is stamped and the result handed to the [`ResultSink`] under
//! that lock, so every sink sees results in non-decreasing `fused_at` order.
//!
//! The engine is passive: it never sleeps. Whoever opens a sample receives a
//! cancellation token and is responsible for calling [`FusionEngine::fuse_now`]
//! when the wait expires (see `pipeline`).

pub mod grading;

pub use grading::{combine, Composite, GradeTable};

use crate::ingest::FusedSamples;
use crate::utils::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqal_common::config::FusionConfig;
use sqal_common::types::{FusionResult, ModalityAnalysis};
use sqal_common::{Modality, SampleId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fusion failures, scoped to a single sample
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// The wait ended with zero analyses; the sample was discarded
    #[error("no analyses arrived for sample {0}; sample discarded")]
    NoData(SampleId),

    #[error("sample {0} was discarded earlier for lack of data")]
    Discarded(SampleId),

    #[error("sample {0} was cancelled before fusion")]
    Cancelled(SampleId),

    #[error("sample {0} is unknown")]
    UnknownSample(SampleId),
}

/// Receives every fused result, in `fused_at` order
///
/// Called with the fuse clock held: implementations must not block or call
/// back into the engine.
pub trait ResultSink: Send + Sync {
    fn publish(&self, result: &Arc<FusionResult>);
}

/// Engine settings derived from [`FusionConfig`]
#[derive(Debug, Clone)]
pub struct FusionSettings {
    pub expected: BTreeSet<Modality>,
    pub timeout: Duration,
    pub disagreement_threshold: f64,
    pub grades: GradeTable,
    pub retention: usize,
}

impl FusionSettings {
    pub fn from_config(config: &FusionConfig) -> Self {
        Self {
            expected: config.expected_modalities.iter().copied().collect(),
            timeout: Duration::from_millis(config.timeout_ms),
            disagreement_threshold: config.disagreement_threshold,
            grades: GradeTable::from_config(config),
            retention: config.retention.max(1),
        }
    }
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self::from_config(&FusionConfig::default())
    }
}

/// Result of opening a sample for collection
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// A new WAITING record; the caller owns its wait
    Opened(CancellationToken),
    /// The sample is already waiting
    AlreadyWaiting,
    /// The sample is already fused
    AlreadyFused,
}

/// Result of recording one analysis
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Recorded; still waiting for the listed modalities
    Waiting { missing: Vec<Modality> },
    /// This analysis completed the sample
    Fused(Arc<FusionResult>),
    /// The sample had already been fused; the analysis was ignored
    Late(Arc<FusionResult>),
}

/// Result of a forced fusion
#[derive(Debug, Clone)]
pub enum FuseOutcome {
    /// This call performed the fusion
    Fused(Arc<FusionResult>),
    /// The sample was fused earlier; the cached result is returned unchanged
    Cached(Arc<FusionResult>),
}

impl FuseOutcome {
    pub fn into_result(self) -> Arc<FusionResult> {
        match self {
            FuseOutcome::Fused(result) | FuseOutcome::Cached(result) => result,
        }
    }
}

/// Result of withdrawing a sample
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled,
    /// Cancelling a fused sample is a no-op
    AlreadyFused(Arc<FusionResult>),
    /// The sample had already been discarded or cancelled
    AlreadyClosed,
    NotFound,
}

/// Externally visible state of a sample
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SampleStatus {
    Waiting(PendingSummary),
    Fused { result: Arc<FusionResult> },
    Discarded,
    Cancelled,
}

/// Snapshot of a WAITING sample
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub sample_id: SampleId,
    pub received: Vec<Modality>,
    pub missing: Vec<Modality>,
    pub opened_at: DateTime<Utc>,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub fused: u64,
    pub partial: u64,
    pub low_confidence: u64,
    pub discarded: u64,
    pub cancelled: u64,
    pub late_analyses: u64,
    pub pending: u64,
}

struct PendingSample {
    analyses: BTreeMap<Modality, ModalityAnalysis>,
    opened_at: DateTime<Utc>,
    token: CancellationToken,
    /// Set once the record reached a terminal state
    closed: bool,
}

impl PendingSample {
    fn new() -> Self {
        Self {
            analyses: BTreeMap::new(),
            opened_at: Utc::now(),
            token: CancellationToken::new(),
            closed: false,
        }
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Fused(Arc<FusionResult>),
    Discarded,
    Cancelled,
}

/// Bounded log of terminal samples, oldest evicted first
struct TerminalLog {
    entries: HashMap<SampleId, (Terminal, u64)>,
    order: VecDeque<(SampleId, u64)>,
    next_generation: u64,
    capacity: usize,
}

impl TerminalLog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
            capacity,
        }
    }

    fn get(&self, sample_id: &SampleId) -> Option<&Terminal> {
        self.entries.get(sample_id).map(|(terminal, _)| terminal)
    }

    fn fused(&self, sample_id: &SampleId) -> Option<Arc<FusionResult>> {
        match self.get(sample_id) {
            Some(Terminal::Fused(result)) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    fn record(&mut self, sample_id: SampleId, terminal: Terminal) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(sample_id.clone(), (terminal, generation));
        self.order.push_back((sample_id, generation));

        while self.entries.len() > self.capacity {
            let Some((oldest, generation)) = self.order.pop_front() else {
                break;
            };
            // Skip order slots superseded by a newer record of the same sample
            if self.entries.get(&oldest).is_some_and(|(_, g)| *g == generation) {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Drop a discarded/cancelled record so the sample can be collected again
    fn reopen(&mut self, sample_id: &SampleId) {
        if matches!(self.get(sample_id), Some(Terminal::Discarded | Terminal::Cancelled)) {
            self.entries.remove(sample_id);
        }
    }
}

#[derive(Default)]
struct Counters {
    fused: AtomicU64,
    partial: AtomicU64,
    low_confidence: AtomicU64,
    discarded: AtomicU64,
    cancelled: AtomicU64,
    late_analyses: AtomicU64,
}

/// In-memory join point between analyzers and delivery
pub struct FusionEngine {
    settings: FusionSettings,
    pending: Mutex<HashMap<SampleId, Arc<Mutex<PendingSample>>>>,
    terminal: Mutex<TerminalLog>,
    /// Last `fused_at` handed out
    fuse_clock: Mutex<DateTime<Utc>>,
    sink: Option<Arc<dyn ResultSink>>,
    counters: Counters,
}

impl FusionEngine {
    pub fn new(settings: FusionSettings) -> Self {
        let retention = settings.retention;
        Self {
            settings,
            pending: Mutex::new(HashMap::new()),
            terminal: Mutex::new(TerminalLog::new(retention)),
            fuse_clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            sink: None,
            counters: Counters::default(),
        }
    }

    /// Hand every fused result to `sink` as part of the fusion step
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    /// Start collecting a sample (WAITING)
    pub fn open(&self, sample_id: &SampleId) -> OpenOutcome {
        let mut pending = lock(&self.pending);
        if pending.contains_key(sample_id) {
            return OpenOutcome::AlreadyWaiting;
        }

        {
            let mut terminal = lock(&self.terminal);
            if terminal.fused(sample_id).is_some() {
                return OpenOutcome::AlreadyFused;
            }
            terminal.reopen(sample_id);
        }

        let record = PendingSample::new();
        let token = record.token.clone();
        pending.insert(sample_id.clone(), Arc::new(Mutex::new(record)));
        debug!("Sample {} opened (waiting up to {:?})", sample_id, self.settings.timeout);
        OpenOutcome::Opened(token)
    }

    /// Record an analysis; fuses immediately once every expected modality reported
    ///
    /// A sample that was never opened is opened implicitly. A repeated
    /// analysis for the same modality replaces the earlier one.
    pub fn submit(&self, analysis: ModalityAnalysis) -> SubmitOutcome {
        let sample_id = analysis.sample_id.clone();
        let record = self.record_for(&sample_id);
        let mut sample = lock(&record);

        if let Some(result) = lock(&self.terminal).fused(&sample_id) {
            if !sample.closed {
                sample.closed = true;
                sample.token.cancel();
                self.remove_pending(&sample_id, &record);
            }
            self.counters.late_analyses.fetch_add(1, Ordering::Relaxed);
            debug!("Late {} analysis for fused sample {} ignored", analysis.modality, sample_id);
            return SubmitOutcome::Late(result);
        }

        if sample.closed {
            // Closed without fusing (discard/cancel raced this submit): start over
            drop(sample);
            return self.submit(analysis);
        }

        if sample.analyses.insert(analysis.modality, analysis).is_some() {
            debug!("Replaced earlier analysis for sample {}", sample_id);
        }

        let missing = self.missing(&sample.analyses);
        if !missing.is_empty() {
            return SubmitOutcome::Waiting { missing };
        }

        let result = self.close_fused(&sample_id, &record, &mut sample);
        SubmitOutcome::Fused(result)
    }

    /// Fuse a sample now with whatever has arrived
    ///
    /// Idempotent: a FUSED sample returns its cached result. A WAITING sample
    /// with no analyses is discarded and reported as [`FusionError::NoData`].
    pub fn fuse_now(&self, sample_id: &SampleId) -> Result<FuseOutcome, FusionError> {
        let record = match lock(&self.pending).get(sample_id) {
            Some(record) => Arc::clone(record),
            None => return self.terminal_outcome(sample_id),
        };

        let mut sample = lock(&record);
        if sample.closed {
            drop(sample);
            return self.terminal_outcome(sample_id);
        }

        if sample.analyses.is_empty() {
            sample.closed = true;
            sample.token.cancel();
            lock(&self.terminal).record(sample_id.clone(), Terminal::Discarded);
            self.remove_pending(sample_id, &record);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            warn!("Sample {} discarded: no analyses arrived", sample_id);
            return Err(FusionError::NoData(sample_id.clone()));
        }

        let result = self.close_fused(sample_id, &record, &mut sample);
        Ok(FuseOutcome::Fused(result))
    }

    /// Fuse a sample, returning the (possibly cached) result
    pub fn fuse(&self, sample_id: &SampleId) -> Result<Arc<FusionResult>, FusionError> {
        self.fuse_now(sample_id).map(FuseOutcome::into_result)
    }

    /// Withdraw a WAITING sample
    pub fn cancel(&self, sample_id: &SampleId) -> CancelOutcome {
        let record = match lock(&self.pending).get(sample_id) {
            Some(record) => Arc::clone(record),
            None => return self.cancel_terminal(sample_id),
        };

        let mut sample = lock(&record);
        if sample.closed {
            drop(sample);
            return self.cancel_terminal(sample_id);
        }

        sample.closed = true;
        sample.token.cancel();
        lock(&self.terminal).record(sample_id.clone(), Terminal::Cancelled);
        self.remove_pending(sample_id, &record);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        info!("Sample {} cancelled", sample_id);
        CancelOutcome::Cancelled
    }

    /// Current state of a sample, if known
    pub fn state(&self, sample_id: &SampleId) -> Option<SampleStatus> {
        let record = lock(&self.pending).get(sample_id).map(Arc::clone);
        if let Some(record) = record {
            let sample = lock(&record);
            if !sample.closed {
                return Some(SampleStatus::Waiting(self.summarize(sample_id, &sample)));
            }
        }

        match lock(&self.terminal).get(sample_id)? {
            Terminal::Fused(result) => Some(SampleStatus::Fused {
                result: Arc::clone(result),
            }),
            Terminal::Discarded => Some(SampleStatus::Discarded),
            Terminal::Cancelled => Some(SampleStatus::Cancelled),
        }
    }

    /// Snapshot of every WAITING sample, oldest first
    pub fn pending(&self) -> Vec<PendingSummary> {
        let records: Vec<(SampleId, Arc<Mutex<PendingSample>>)> = lock(&self.pending)
            .iter()
            .map(|(id, record)| (id.clone(), Arc::clone(record)))
            .collect();

        let mut summaries: Vec<PendingSummary> = records
            .iter()
            .filter_map(|(id, record)| {
                let sample = lock(record);
                (!sample.closed).then(|| self.summarize(id, &sample))
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.opened_at
                .cmp(&b.opened_at)
                .then_with(|| a.sample_id.cmp(&b.sample_id))
        });
        summaries
    }

    pub fn stats(&self) -> FusionStats {
        FusionStats {
            fused: self.counters.fused.load(Ordering::Relaxed),
            partial: self.counters.partial.load(Ordering::Relaxed),
            low_confidence: self.counters.low_confidence.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            late_analyses: self.counters.late_analyses.load(Ordering::Relaxed),
            pending: lock(&self.pending).len() as u64,
        }
    }

    fn record_for(&self, sample_id: &SampleId) -> Arc<Mutex<PendingSample>> {
        let mut pending = lock(&self.pending);
        if let Some(record) = pending.get(sample_id) {
            return Arc::clone(record);
        }
        lock(&self.terminal).reopen(sample_id);
        let record = Arc::new(Mutex::new(PendingSample::new()));
        pending.insert(sample_id.clone(), Arc::clone(&record));
        record
    }

    fn missing(&self, analyses: &BTreeMap<Modality, ModalityAnalysis>) -> Vec<Modality> {
        self.settings
            .expected
            .iter()
            .filter(|m| !analyses.contains_key(m))
            .copied()
            .collect()
    }

    fn summarize(&self, sample_id: &SampleId, sample: &PendingSample) -> PendingSummary {
        PendingSummary {
            sample_id: sample_id.clone(),
            received: sample.analyses.keys().copied().collect(),
            missing: self.missing(&sample.analyses),
            opened_at: sample.opened_at,
        }
    }

    /// Build the result, log it as FUSED and evict the pending record
    ///
    /// Must be called with the record locked and not yet closed.
    fn close_fused(
        &self,
        sample_id: &SampleId,
        record: &Arc<Mutex<PendingSample>>,
        sample: &mut PendingSample,
    ) -> Arc<FusionResult> {
        sample.closed = true;
        sample.token.cancel();

        let result = {
            let mut clock = lock(&self.fuse_clock);
            // Wall-clock steps backwards must not reorder results
            let fused_at = Utc::now().max(*clock);
            *clock = fused_at;

            let result = Arc::new(self.build_result(sample_id, &sample.analyses, fused_at));
            lock(&self.terminal).record(sample_id.clone(), Terminal::Fused(Arc::clone(&result)));
            if let Some(sink) = &self.sink {
                sink.publish(&result);
            }
            result
        };
        self.remove_pending(sample_id, record);

        self.counters.fused.fetch_add(1, Ordering::Relaxed);
        if !result.missing_modalities.is_empty() {
            self.counters.partial.fetch_add(1, Ordering::Relaxed);
        }
        if result.low_confidence {
            self.counters.low_confidence.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Sample {} fused with low confidence (disagreement {:.3}); manual review required",
                sample_id, result.disagreement
            );
        }
        info!(
            "Sample {} fused: grade {} (score {:.3}, {} modalities)",
            sample_id,
            result.final_grade,
            result.composite_score,
            result.contributing_analyses.len()
        );
        result
    }

    fn build_result(
        &self,
        sample_id: &SampleId,
        analyses: &BTreeMap<Modality, ModalityAnalysis>,
        fused_at: DateTime<Utc>,
    ) -> FusionResult {
        let ordered: Vec<&ModalityAnalysis> = analyses.values().collect();
        // Callers guarantee at least one analysis
        let composite = combine(&ordered).unwrap_or(Composite {
            score: 0.0,
            disagreement: 0.0,
            unweighted: true,
        });

        FusionResult {
            sample_id: sample_id.clone(),
            final_grade: self.settings.grades.grade(composite.score),
            composite_score: composite.score,
            contributing_analyses: analyses.values().cloned().collect(),
            missing_modalities: self.missing(analyses),
            disagreement: composite.disagreement,
            low_confidence: composite.unweighted
                || composite.disagreement > self.settings.disagreement_threshold,
            fused_at,
        }
    }

    fn remove_pending(&self, sample_id: &SampleId, record: &Arc<Mutex<PendingSample>>) {
        let mut pending = lock(&self.pending);
        if pending.get(sample_id).is_some_and(|current| Arc::ptr_eq(current, record)) {
            pending.remove(sample_id);
        }
    }

    fn terminal_outcome(&self, sample_id: &SampleId) -> Result<FuseOutcome, FusionError> {
        match lock(&self.terminal).get(sample_id) {
            Some(Terminal::Fused(result)) => Ok(FuseOutcome::Cached(Arc::clone(result))),
            Some(Terminal::Discarded) => Err(FusionError::Discarded(sample_id.clone())),
            Some(Terminal::Cancelled) => Err(FusionError::Cancelled(sample_id.clone())),
            None => Err(FusionError::UnknownSample(sample_id.clone())),
        }
    }

    fn cancel_terminal(&self, sample_id: &SampleId) -> CancelOutcome {
        match lock(&self.terminal).get(sample_id) {
            Some(Terminal::Fused(result)) => CancelOutcome::AlreadyFused(Arc::clone(result)),
            Some(Terminal::Discarded | Terminal::Cancelled) => CancelOutcome::AlreadyClosed,
            None => CancelOutcome::NotFound,
        }
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(FusionSettings::default())
    }
}

impl FusedSamples for FusionEngine {
    fn is_fused(&self, sample_id: &SampleId) -> bool {
        lock(&self.terminal).fused(sample_id).is_some()
    }
}
