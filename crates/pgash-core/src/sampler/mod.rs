//! Session sampler: periodic snapshots of the session activity view.
//!
//! Each tick runs one session query with a statement timeout, converts the
//! rows into [`SessionSample`]s, stores them in a bounded [`SampleBuffer`] and
//! hands the tick's [`SampleBatch`] to the pipeline over a bounded channel.
//!
//! A failed or timed-out query skips the tick; the next one runs normally.
//! The session query is never gated, so sampling resumes on the first tick
//! after the database recovers.

mod analysis;
mod buffer;

use std::sync::Arc;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use analysis::{BlockingSummary, WaitEventSummary, blocking_summary, wait_event_summary};
pub use buffer::{SampleBuffer, SamplesSince};

use crate::config::SessionSamplerConfig;
use crate::model::{SampleBatch, SessionSample};
use crate::shutdown::Shutdown;
use crate::source::{QueryError, QueryExecutor};

/// Smoothing factor for the moving averages in [`SamplerStats`].
const EWMA_ALPHA: f64 = 0.1;

fn ewma(prev: f64, value: f64, first: bool) -> f64 {
    if first {
        value
    } else {
        prev * (1.0 - EWMA_ALPHA) + value * EWMA_ALPHA
    }
}

/// Counters and moving averages of the sampler loop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SamplerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub samples_collected: u64,
    /// Rows that could not be converted into samples.
    pub rows_skipped: u64,
    /// Batches not delivered because the channel was full.
    pub dropped_batches: u64,
    pub avg_active_sessions: f64,
    pub avg_waiting_sessions: f64,
    pub avg_tick_ms: f64,
    pub buffered: usize,
}

/// Read access to the buffer and stats, shareable across threads.
#[derive(Clone, Debug)]
pub struct SamplerView {
    buffer: Arc<Mutex<SampleBuffer>>,
    stats: Arc<Mutex<SamplerStats>>,
    interval: Duration,
}

impl SamplerView {
    /// Samples with `timestamp > since`, oldest first. See [`SamplesSince`].
    pub fn samples(&self, since: DateTime<Utc>) -> SamplesSince<'_> {
        SamplesSince::new(self.buffer.lock(), since)
    }

    pub fn stats(&self) -> SamplerStats {
        let mut stats = self.stats.lock().clone();
        stats.buffered = self.buffer.lock().len();
        stats
    }

    pub fn wait_event_summary(&self, since: DateTime<Utc>) -> Vec<WaitEventSummary> {
        let buffer = self.buffer.lock();
        wait_event_summary(buffer.iter_since(since), self.interval)
    }

    pub fn blocking_summary(&self, since: DateTime<Utc>) -> Vec<BlockingSummary> {
        let buffer = self.buffer.lock();
        blocking_summary(buffer.iter_since(since), self.interval)
    }
}

/// Periodic session sampler over any [`QueryExecutor`].
pub struct SessionSampler<E> {
    executor: E,
    config: SessionSamplerConfig,
    view: SamplerView,
    tick: u64,
}

impl<E: QueryExecutor> SessionSampler<E> {
    pub fn new(executor: E, config: SessionSamplerConfig) -> Self {
        let view = SamplerView {
            buffer: Arc::new(Mutex::new(SampleBuffer::new(
                config.buffer_size,
                config.retention_duration,
            ))),
            stats: Arc::new(Mutex::new(SamplerStats::default())),
            interval: config.collection_interval,
        };
        Self {
            executor,
            config,
            view,
            tick: 0,
        }
    }

    pub fn view(&self) -> SamplerView {
        self.view.clone()
    }

    pub fn samples(&self, since: DateTime<Utc>) -> SamplesSince<'_> {
        self.view.samples(since)
    }

    pub fn stats(&self) -> SamplerStats {
        self.view.stats()
    }

    /// Runs one collection tick.
    ///
    /// Samples are buffered before the batch is returned. A failed query
    /// skips the tick and is returned as is.
    pub fn collect_tick(&mut self) -> Result<SampleBatch, QueryError> {
        self.tick += 1;
        let started = Instant::now();
        let timeout = self.config.effective_query_timeout();

        let rows = match self.executor.query_sessions(timeout) {
            Ok(rows) => rows,
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                warn!(
                    operation = "query_sessions",
                    tick = self.tick,
                    duration_ms,
                    error = %e,
                    "session query failed, skipping tick"
                );
                let mut stats = self.view.stats.lock();
                stats.ticks += 1;
                stats.failed_ticks += 1;
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut samples: Vec<SessionSample> = Vec::with_capacity(rows.len());
        let mut skipped = 0u64;
        for row in rows {
            let pid = row.pid;
            match row.into_sample(now, self.config.max_query_text_len) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    skipped += 1;
                    warn!(pid = ?pid, error = %e, "skipping malformed session row");
                }
            }
        }

        {
            let mut buffer = self.view.buffer.lock();
            for sample in &samples {
                buffer.push(sample.clone());
            }
            buffer.evict_expired(now);
        }

        let active = samples.iter().filter(|s| s.is_active()).count();
        let waiting = samples.iter().filter(|s| s.is_waiting()).count();
        let tick_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut stats = self.view.stats.lock();
            let first = stats.ticks == stats.failed_ticks;
            stats.ticks += 1;
            stats.samples_collected += samples.len() as u64;
            stats.rows_skipped += skipped;
            stats.avg_active_sessions = ewma(stats.avg_active_sessions, active as f64, first);
            stats.avg_waiting_sessions = ewma(stats.avg_waiting_sessions, waiting as f64, first);
            stats.avg_tick_ms = ewma(stats.avg_tick_ms, tick_ms, first);
        }

        debug!(
            tick = self.tick,
            samples = samples.len(),
            active,
            waiting,
            duration_ms = tick_ms as u64,
            "session tick collected"
        );

        Ok(SampleBatch {
            tick: self.tick,
            collected_at: Some(now),
            samples,
        })
    }
}

impl<E: QueryExecutor + 'static> SessionSampler<E> {
    /// Moves the sampler onto its own thread.
    ///
    /// The loop exits before starting a new tick once `shutdown` is
    /// triggered or the receiving side of `tx` is gone.
    pub fn start(mut self, shutdown: Shutdown, tx: SyncSender<SampleBatch>) -> SamplerHandle {
        let view = self.view.clone();
        let interval = self.config.collection_interval;

        let spawned = std::thread::Builder::new()
            .name("pgash-sampler".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "session sampler started");
                while !shutdown.is_triggered() {
                    let started = Instant::now();
                    if let Ok(batch) = self.collect_tick() {
                        match tx.try_send(batch) {
                            Ok(()) => {}
                            Err(TrySendError::Full(batch)) => {
                                self.view.stats.lock().dropped_batches += 1;
                                warn!(tick = batch.tick, samples = batch.len(),
                                    "pipeline is behind, dropping batch");
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                info!("pipeline receiver closed, stopping sampler");
                                break;
                            }
                        }
                    }
                    let remaining = interval.saturating_sub(started.elapsed());
                    if !shutdown.sleep(remaining) {
                        break;
                    }
                }
                info!(ticks = self.tick, "session sampler stopped");
            });

        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn sampler thread");
                None
            }
        };

        SamplerHandle { thread, view }
    }
}

/// Handle to a running sampler thread.
pub struct SamplerHandle {
    thread: Option<JoinHandle<()>>,
    view: SamplerView,
}

impl SamplerHandle {
    /// False when the thread could not be spawned.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn view(&self) -> SamplerView {
        self.view.clone()
    }

    pub fn samples(&self, since: DateTime<Utc>) -> SamplesSince<'_> {
        self.view.samples(since)
    }

    pub fn stats(&self) -> SamplerStats {
        self.view.stats()
    }

    /// Waits for the sampler thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("sampler thread panicked");
        }
    }
}
