//! pgashd - adaptive Active Session History daemon.
//!
//! Samples `pg_stat_activity` on a fixed interval, thins and enriches the
//! samples, and writes the resulting datapoints as JSON lines.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Returns unused jemalloc pages to the operating system.
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid NUL-terminated name and no in/out buffers.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, sync_channel};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgash_core::breaker::CircuitBreaker;
use pgash_core::config::{ConfigError, PipelineConfig};
use pgash_core::export::{JsonLinesSink, RecordSink};
use pgash_core::model::SampleBatch;
use pgash_core::pipeline::Pipeline;
use pgash_core::plan::PlanExtractor;
use pgash_core::sampler::{SamplerView, SessionSampler};
use pgash_core::shutdown::Shutdown;
use pgash_core::source::PostgresExecutor;

/// How often stage counters are logged.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);
/// Wait events and blockers listed in the periodic summary.
const SUMMARY_TOP: usize = 5;
/// How long the pipeline loop waits for a batch before re-checking shutdown.
const RECV_SLICE: Duration = Duration::from_millis(100);

/// Adaptive Active Session History daemon.
#[derive(Parser)]
#[command(name = "pgashd", about = "Adaptive session telemetry for PostgreSQL", version)]
struct Args {
    /// YAML configuration file. Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// libpq connection string. Overrides session_sampler.datasource.
    #[arg(short, long, env = "PGASH_DATASOURCE", hide_env_values = true)]
    datasource: Option<String>,

    /// Write datapoints to this file instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Logs go to stderr so stdout stays free for datapoints.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgashd", "pgash_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Loads the config file (or defaults), applies CLI overrides and validates.
fn load_config(
    path: Option<&PathBuf>,
    datasource: Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let mut config = match path {
        Some(p) => PipelineConfig::from_file(p)?,
        None => PipelineConfig::default(),
    };
    if let Some(ds) = datasource {
        config.session_sampler.datasource = ds;
    }
    config.validate()?;
    Ok(config)
}

fn open_output(path: Option<&PathBuf>) -> io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(File::create(p)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

/// Returns true when the periodic summary should be logged.
fn summary_due(last: Instant, now: Instant) -> bool {
    now.saturating_duration_since(last) >= SUMMARY_INTERVAL
}

/// Masks `password=...` in a libpq connection string.
fn redact_datasource(ds: &str) -> String {
    ds.split_whitespace()
        .map(|kv| match kv.split_once('=') {
            Some((k, _)) if k.eq_ignore_ascii_case("password") => format!("{}=***", k),
            _ => kv.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Logs the busiest wait events and blockers buffered since `since`.
///
/// Returns how many distinct wait events and blockers were seen.
fn log_activity_summary(view: &SamplerView, since: DateTime<Utc>) -> (usize, usize) {
    let waits = view.wait_event_summary(since);
    for w in waits.iter().take(SUMMARY_TOP) {
        info!(
            event = %w.event,
            count = w.count,
            sessions = w.sessions,
            queries = w.queries,
            approx_wait_ms = w.approx_wait.as_millis() as u64,
            "top wait event"
        );
    }

    let blockers = view.blocking_summary(since);
    for b in blockers.iter().take(SUMMARY_TOP) {
        info!(
            blocker = %b.blocker_session_id,
            blocked_sessions = b.blocked_sessions,
            user = b.blocker_username.as_deref().unwrap_or("-"),
            state = b.blocker_state.as_deref().unwrap_or("-"),
            approx_blocked_ms = b.approx_blocked_time.as_millis() as u64,
            query = b.blocker_query.as_deref().unwrap_or("-"),
            "top blocker"
        );
    }
    (waits.len(), blockers.len())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = match load_config(args.config.as_ref(), args.datasource.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pgashd: {}", e);
            std::process::exit(2);
        }
    };

    let output = match open_output(args.output.as_ref()) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("pgashd: cannot open output: {}", e);
            std::process::exit(1);
        }
    };
    let mut sink = JsonLinesSink::new(output);

    let sampler_cfg = &config.session_sampler;
    info!("pgashd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        datasource = %redact_datasource(&sampler_cfg.datasource),
        interval_ms = sampler_cfg.collection_interval.as_millis() as u64,
        buffer_size = sampler_cfg.buffer_size,
        base_rate = config.adaptive_sampler.base_rate,
        budget_per_minute = config.cost_control.max_datapoints_per_minute,
        plans = config.plan_extractor.enabled,
        "configuration loaded"
    );

    let mut session_executor =
        PostgresExecutor::with_connection_string(sampler_cfg.datasource.clone())
            .with_max_query_text_len(sampler_cfg.max_query_text_len);
    if let Err(e) = session_executor.try_connect() {
        // the sampler keeps retrying on every tick
        warn!(error = %e, "initial connection failed");
    }
    let sampler = SessionSampler::new(session_executor, sampler_cfg.clone());

    let plan_breaker = Arc::new(CircuitBreaker::new("explain", config.circuit_breaker.clone()));
    let mut plan_executor =
        PostgresExecutor::with_connection_string(sampler_cfg.datasource.clone());
    if config.plan_extractor.enabled
        && let Err(e) = plan_executor.try_connect()
    {
        debug!(error = %e, "explain connection deferred");
    }
    let database = plan_executor.database();
    let mut plans = PlanExtractor::new(
        plan_executor,
        Arc::clone(&plan_breaker),
        config.plan_extractor.clone(),
    )
    .with_max_query_text_len(sampler_cfg.max_query_text_len);
    match database {
        Some(db) => {
            info!(database = %db, "plans limited to the connected database");
            plans = plans.with_database(db);
        }
        None => warn!("cannot tell the connected database, explaining every database"),
    }

    let shutdown = Shutdown::new();
    let s = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.trigger();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let (tx, rx) = sync_channel::<SampleBatch>(sampler_cfg.channel_capacity);
    let handle = sampler.start(shutdown.clone(), tx);
    if !handle.is_running() {
        error!("sampler thread did not start");
        std::process::exit(1);
    }

    let mut pipeline = Pipeline::new(config.clone())
        .with_plan_extractor(plans)
        .with_sampler_view(handle.view());

    info!("Starting pipeline loop");
    let mut pending: VecDeque<SampleBatch> = VecDeque::new();
    let mut last_summary = Instant::now();
    let mut last_summary_at = Utc::now();

    while !shutdown.is_triggered() {
        match rx.recv_timeout(RECV_SLICE) {
            Ok(batch) => pending.push_back(batch),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("sampler stopped, leaving pipeline loop");
                break;
            }
        }
        pending.extend(rx.try_iter());

        while let Some(batch) = pending.pop_front() {
            let points = pipeline.process_batch(batch, pending.len());
            if points.is_empty() {
                continue;
            }
            if let Err(e) = sink.write_batch(&points).and_then(|_| sink.flush()) {
                error!(error = %e, "failed to write datapoints");
            }
        }

        let now = Instant::now();
        if summary_due(last_summary, now) {
            last_summary = now;
            let summary_since = last_summary_at;
            last_summary_at = Utc::now();
            pipeline.log_summary();
            let sampler_stats = handle.stats();
            info!(
                ticks = sampler_stats.ticks,
                failed_ticks = sampler_stats.failed_ticks,
                dropped_batches = sampler_stats.dropped_batches,
                buffered = sampler_stats.buffered,
                avg_active = sampler_stats.avg_active_sessions,
                avg_tick_ms = sampler_stats.avg_tick_ms,
                explain_breaker = %plan_breaker.state(),
                "sampler summary"
            );
            let (wait_events, blockers) = log_activity_summary(&handle.view(), summary_since);
            debug!(wait_events, blockers, "activity summary logged");
            release_memory_to_os();
            debug!("Memory released after summary");
        }
    }

    info!("Shutting down...");
    shutdown.trigger();
    handle.join();

    // drain what the sampler delivered before it stopped
    pending.extend(rx.try_iter());
    while let Some(batch) = pending.pop_front() {
        let points = pipeline.process_batch(batch, pending.len());
        if let Err(e) = sink.write_batch(&points) {
            error!(error = %e, "failed to write datapoints");
        }
    }
    if let Err(e) = sink.flush() {
        error!(error = %e, "failed to flush output");
    }
    pipeline.log_summary();
    info!(written = sink.written(), "Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_datasource_names_the_field() {
        let err = load_config(None, None).unwrap_err();
        assert!(err.to_string().contains("session_sampler.datasource"));
    }

    #[test]
    fn cli_datasource_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "session_sampler:\n  datasource: \"host=a\"\n  collection_interval: 2s"
        )
        .unwrap();
        let path = file.path().to_path_buf();

        let cfg = load_config(Some(&path), Some("host=b".to_string())).unwrap();
        assert_eq!(cfg.session_sampler.datasource, "host=b");
        assert_eq!(cfg.session_sampler.collection_interval, Duration::from_secs(2));
    }

    #[test]
    fn invalid_value_is_rejected_before_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "session_sampler:\n  datasource: \"host=a\"\nadaptive_sampler:\n  min_rate: 0.9\n  base_rate: 0.5"
        )
        .unwrap();
        let path = file.path().to_path_buf();
        let err = load_config(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("adaptive_sampler"));
    }

    #[test]
    fn summary_interval() {
        let t0 = Instant::now();
        assert!(!summary_due(t0, t0 + Duration::from_secs(59)));
        assert!(summary_due(t0, t0 + SUMMARY_INTERVAL));
    }

    #[test]
    fn activity_summary_reads_the_sampler_buffer() {
        use pgash_core::config::SessionSamplerConfig;
        use pgash_core::source::MockExecutor;
        use pgash_core::source::mock::mixed_workload;

        let exec = MockExecutor::new();
        exec.push_sessions(mixed_workload(Utc::now().timestamp_millis()));
        let cfg = SessionSamplerConfig {
            datasource: "mock".to_string(),
            ..Default::default()
        };
        let mut sampler = SessionSampler::new(exec, cfg);
        let since = Utc::now() - chrono::Duration::minutes(1);
        sampler.collect_tick().unwrap();

        let (wait_events, blockers) = log_activity_summary(&sampler.view(), since);
        assert!(wait_events >= 2);
        assert_eq!(blockers, 1);
    }

    #[test]
    fn password_is_redacted() {
        assert_eq!(
            redact_datasource("host=db user=app password=s3cret"),
            "host=db user=app password=***"
        );
    }
}
