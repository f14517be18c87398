use std::sync::Arc;
use std::sync::mpsc::sync_channel;
use std::time::Duration;

use chrono::Utc;
use pgash_core::breaker::CircuitBreaker;
use pgash_core::config::PipelineConfig;
use pgash_core::export::{JsonLinesSink, MemorySink, RecordSink};
use pgash_core::model::{
    DataPoint, METRIC_ACTIVE_SESSIONS, METRIC_BLOCKED_SESSIONS, METRIC_LONG_RUNNING_QUERIES,
    METRIC_WAIT_EVENTS, SampleBatch,
};
use pgash_core::pipeline::Pipeline;
use pgash_core::plan::PlanExtractor;
use pgash_core::sampler::SessionSampler;
use pgash_core::shutdown::Shutdown;
use pgash_core::source::mock::{SIMPLE_PLAN_JSON, blocking_chain, busy_system, mixed_workload};
use pgash_core::source::{MockExecutor, SessionRow};

const CONFIG: &str = r#"
session_sampler:
  datasource: "host=localhost user=monitor"
  collection_interval: 20ms
adaptive_sampler:
  base_rate: 1.0
query_correlator:
  frequent_query_threshold: 3
cost_control:
  max_datapoints_per_minute: 100000
"#;

fn config() -> PipelineConfig {
    let cfg = PipelineConfig::from_yaml_str(CONFIG).unwrap();
    cfg.validate().unwrap();
    cfg
}

fn batch(tick: u64, rows: Vec<SessionRow>) -> SampleBatch {
    let now = Utc::now();
    SampleBatch {
        tick,
        collected_at: Some(now),
        samples: rows
            .into_iter()
            .map(|r| r.into_sample(now, 4096).unwrap())
            .collect(),
    }
}

fn with_name<'a>(points: &'a [DataPoint], name: &str) -> Vec<&'a DataPoint> {
    points.iter().filter(|p| p.name == name).collect()
}

#[test]
fn markers_survive_the_full_pipeline() {
    let cfg = config();
    let mock = MockExecutor::new();
    mock.set_explain(SIMPLE_PLAN_JSON);
    let breaker = Arc::new(CircuitBreaker::new("plan", cfg.circuit_breaker.clone()));
    let plans = PlanExtractor::new(mock.clone(), breaker, cfg.plan_extractor.clone());
    let mut pipeline = Pipeline::new(cfg).with_plan_extractor(plans);

    let now_ms = Utc::now().timestamp_millis();
    let mut all = Vec::new();
    for tick in 1..=4 {
        all.extend(pipeline.process_batch(batch(tick, mixed_workload(now_ms)), 0));
    }

    // blocked: two waiters per tick
    let blocked = with_name(&all, METRIC_BLOCKED_SESSIONS);
    assert_eq!(blocked.len(), 8);
    assert!(blocked.iter().all(|p| p.attr_str("correlation.key") == Some("qid:901")));
    assert!(
        blocked
            .iter()
            .any(|p| p.attr_str("correlation.queries") == Some("qid:900"))
    );

    // slow: the 45s lock holder and the 3s waiters
    let long = with_name(&all, METRIC_LONG_RUNNING_QUERIES);
    assert!(long.iter().any(|p| p.value >= 45_000.0));
    assert!(long.iter().all(|p| p.attr_bool("query.is_slow") == Some(true)));
    assert!(long.iter().any(|p| p.attr_str("plan.fingerprint").is_some()));
    // one EXPLAIN per distinct statement, the rest served from cache
    assert_eq!(mock.explain_calls(), 2);

    // frequent: the busy statements repeat every tick
    let busy: Vec<_> = with_name(&all, METRIC_ACTIVE_SESSIONS)
        .into_iter()
        .filter(|p| p.attr_str("correlation.key") == Some("qid:100"))
        .collect();
    assert!(busy.iter().any(|p| p.attr_bool("query.is_frequent") == Some(true)));
    assert!(
        busy
            .iter()
            .any(|p| p.attr_bool("query.is_frequent") == Some(false))
    );

    // waits
    assert!(
        with_name(&all, METRIC_WAIT_EVENTS)
            .iter()
            .any(|p| p.attr_str("wait_event.name") == Some("PgSleep"))
    );

    // maintenance admitted by policy
    assert!(
        all.iter()
            .any(|p| p.attr_str("sampling.reason") == Some("maintenance"))
    );
}

#[test]
fn sampler_thread_feeds_pipeline_and_sink() {
    let cfg = config();
    let exec = MockExecutor::new();
    exec.set_default_sessions(busy_system(4, Utc::now().timestamp_millis()));
    exec.push_sessions(blocking_chain(Utc::now().timestamp_millis()));

    let sampler = SessionSampler::new(exec.clone(), cfg.session_sampler.clone());
    let shutdown = Shutdown::new();
    let (tx, rx) = sync_channel(cfg.session_sampler.channel_capacity);
    let handle = sampler.start(shutdown.clone(), tx);

    let mut pipeline: Pipeline<MockExecutor> = Pipeline::new(cfg).with_sampler_view(handle.view());
    let mut sink = MemorySink::default();
    for _ in 0..3 {
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let points = pipeline.process_batch(batch, 0);
        sink.write_batch(&points).unwrap();
    }
    shutdown.trigger();
    handle.join();

    assert_eq!(pipeline.stats().batches, 3);
    // first tick is the lock chain, the rest busy traffic
    assert_eq!(with_name(&sink.points, METRIC_BLOCKED_SESSIONS).len(), 2);
    assert_eq!(with_name(&sink.points, METRIC_ACTIVE_SESSIONS).len(), 3 + 4 + 4);

    let mut out = JsonLinesSink::new(Vec::new());
    out.write_batch(&sink.points).unwrap();
    let text = String::from_utf8(out.into_inner()).unwrap();
    assert_eq!(text.lines().count(), sink.points.len());
}
