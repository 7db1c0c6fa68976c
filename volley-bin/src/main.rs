use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use volley_core::config::parse_duration_ms;
use volley_core::{EngineConfig, FireObserver, FireWindow, PartitionOffsets, SharedInstanceMap, WindowInstance};
use volley_fire::{FiringEngine, JsonlObserver, TracingObserver};

#[derive(Parser, Debug)]
#[command(name = "volley", version, about = "Volley window firing CLI", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a JSONL event file through the firing engine
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long)]
        events: PathBuf,
        /// Append every in-flight transition to this JSONL file
        #[arg(long)]
        fire_log: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
        #[arg(long, default_value = "10s")]
        drain_timeout: String,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RunConfig {
    #[serde(flatten)]
    engine: EngineConfig,
    #[serde(default)]
    demo: DemoConfig,
}

#[derive(Debug, Deserialize)]
struct DemoConfig {
    #[serde(default = "default_window_size")]
    window_size: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default = "default_window_name")]
    window_name: String,
    #[serde(default)]
    max_allowed_gap_seconds: Option<u64>,
}

fn default_window_size() -> String {
    "10s".into()
}
fn default_namespace() -> String {
    "demo".into()
}
fn default_window_name() -> String {
    "event_count".into()
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            namespace: default_namespace(),
            window_name: default_window_name(),
            max_allowed_gap_seconds: None,
        }
    }
}

/// One line of the replayed event file.
#[derive(Debug, Deserialize)]
struct EventLine {
    partition: String,
    event_time: serde_json::Value,
    #[serde(default)]
    offset: Option<serde_json::Value>,
}

/// Tumbling event counter that prints one JSON line per fired instance.
struct CountingWindow {
    name: String,
    max_gap: Option<u64>,
    counts: Mutex<HashMap<String, u64>>,
    max_event_times: Mutex<HashMap<String, DateTime<Utc>>>,
    instances: SharedInstanceMap,
    emitted: Mutex<Vec<serde_json::Value>>,
}

impl CountingWindow {
    fn new(name: impl Into<String>, max_gap: Option<u64>) -> Self {
        Self {
            name: name.into(),
            max_gap,
            counts: Mutex::new(HashMap::new()),
            max_event_times: Mutex::new(HashMap::new()),
            instances: SharedInstanceMap::default(),
            emitted: Mutex::new(Vec::new()),
        }
    }

    fn accumulate(&self, instance: &WindowInstance, event_time: DateTime<Utc>) {
        *self.counts.lock().entry(instance.instance_id()).or_insert(0) += 1;
        self.max_event_times
            .lock()
            .entry(instance.partition.clone())
            .and_modify(|m| *m = (*m).max(event_time))
            .or_insert(event_time);
    }
}

#[async_trait::async_trait]
impl FireWindow for CountingWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_event_time(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.max_event_times.lock().get(partition).copied()
    }

    fn max_allowed_gap_seconds(&self) -> Option<u64> {
        self.max_gap
    }

    fn window_instance_map(&self) -> SharedInstanceMap {
        self.instances.clone()
    }

    async fn fire_window_instance(
        &self,
        instance: &WindowInstance,
        offsets: Option<&PartitionOffsets>,
    ) -> anyhow::Result<usize> {
        let id = instance.instance_id();
        let count = self.counts.lock().remove(&id).unwrap_or(0);
        let row = serde_json::json!({
            "window": self.name,
            "partition": instance.partition,
            "start_time": instance.start_time,
            "end_time": instance.end_time,
            "count": count,
            "offsets": offsets,
        });
        println!("{}", serde_json::to_string(&row)?);
        self.emitted.lock().push(row);
        Ok(1)
    }
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
            tracing::info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run {
            config,
            events,
            fire_log,
            http_port,
            drain_timeout,
        } => {
            if http_port != 0 {
                let addr: SocketAddr = format!("127.0.0.1:{}", http_port).parse()?;
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            let cfg = match config {
                Some(path) => toml::from_str::<RunConfig>(&tokio::fs::read_to_string(&path).await?)?,
                None => RunConfig::default(),
            };
            let drain_timeout = Duration::from_millis(parse_duration_ms(&drain_timeout)?.max(0) as u64);
            let observer: Arc<dyn FireObserver> = match fire_log {
                Some(path) => Arc::new(JsonlObserver::new(path)),
                None => Arc::new(TracingObserver),
            };
            run_replay(cfg, &events, observer, drain_timeout).await?;
            Ok(())
        }
    }
}

async fn metrics() -> String {
    volley_core::metrics::render_prometheus()
}

fn parse_event_time(v: &serde_json::Value) -> anyhow::Result<DateTime<Utc>> {
    match v {
        // assume ms epoch
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| anyhow::anyhow!("event_time out of range: {n}")),
        serde_json::Value::String(s) => Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
        other => Err(anyhow::anyhow!("unsupported event_time: {other}")),
    }
}

async fn run_replay(
    cfg: RunConfig,
    events: &Path,
    observer: Arc<dyn FireObserver>,
    drain_timeout: Duration,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let settings = cfg.engine.resolve()?;
    let window = Arc::new(CountingWindow::new(
        cfg.demo.window_name.clone(),
        cfg.demo.max_allowed_gap_seconds,
    ));
    let handle: Arc<dyn FireWindow> = window.clone();
    let engine = FiringEngine::builder(&handle)
        .settings(settings)
        .observer(observer)
        .build();
    engine.start();

    let replayed = replay(&engine, &window, &cfg.demo, events).await?;
    tracing::info!(replayed, pending = engine.pending().len(), "replay finished, draining");

    drain(&engine, drain_timeout).await;
    engine.stop().await;
    let emitted = std::mem::take(&mut *window.emitted.lock());
    tracing::info!(fired = emitted.len(), left = engine.pending().len(), "replay done");
    Ok(emitted)
}

async fn replay(
    engine: &FiringEngine,
    window: &CountingWindow,
    demo: &DemoConfig,
    path: &Path,
) -> anyhow::Result<usize> {
    let size = chrono::Duration::milliseconds(parse_duration_ms(&demo.window_size)?);
    let mut lines = tokio::io::BufReader::new(tokio::fs::File::open(path).await?).lines();
    let mut max_by_partition: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut n = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let ev: EventLine = serde_json::from_str(&line)?;
        let ts = parse_event_time(&ev.event_time)?;
        let instance = WindowInstance::tumbling(&ev.partition, &demo.namespace, &demo.window_name, ts, size);
        window.accumulate(&instance, ts);
        if engine.on_message(instance.clone(), ts) {
            if let Some(offset) = &ev.offset {
                let offset = match offset {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let offsets: PartitionOffsets = [(ev.partition.clone(), offset)].into_iter().collect();
                engine.record_offsets(&instance.instance_id(), offsets).await?;
            }
        }
        max_by_partition
            .entry(ev.partition)
            .and_modify(|m| *m = (*m).max(ts))
            .or_insert(ts);
        n += 1;
    }
    // End of input: push every partition far ahead so the remaining windows close.
    for (partition, max_ts) in max_by_partition {
        engine.advance_watermark(&partition, max_ts + chrono::Duration::days(365 * 100));
    }
    Ok(n)
}

async fn drain(engine: &FiringEngine, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if engine.pending().is_empty() && engine.buffered() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tracing::warn!(pending = engine.pending().len(), "drain timed out with instances still pending");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;
    use volley_fire::NoopObserver;

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let app = app();
        // Touch a metric
        volley_core::metrics::INSTANCES_FIRED.with_label_values(&["fired"]).inc_by(0);
        let res = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.status().is_success());
        let body = body::to_bytes(res.into_body(), 1_048_576).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("volley_instances_fired_total"));
    }

    #[test]
    fn event_time_accepts_millis_and_rfc3339() {
        let a = parse_event_time(&serde_json::json!(1_700_000_000_000i64)).unwrap();
        let b = parse_event_time(&serde_json::json!("2023-11-14T22:13:20Z")).unwrap();
        assert_eq!(a, b);
        assert!(parse_event_time(&serde_json::json!(true)).is_err());
    }

    #[test]
    fn run_config_reads_engine_and_demo_sections() {
        let cfg: RunConfig = toml::from_str(
            r#"
            [scheduler]
            fire_interval = "50ms"
            start_now = true

            [demo]
            window_size = "1m"
            "#,
        )
        .unwrap();
        assert!(cfg.engine.scheduler.start_now);
        assert_eq!(cfg.demo.window_size, "1m");
        assert_eq!(cfg.demo.namespace, "demo");
    }

    #[tokio::test]
    async fn replay_fires_every_bucket_in_order() {
        let path = std::env::temp_dir().join(format!("volley-replay-{}.jsonl", std::process::id()));
        let lines = [
            r#"{"partition":"p0","event_time":1700000001000,"offset":1}"#,
            r#"{"partition":"p0","event_time":1700000002000,"offset":2}"#,
            r#"{"partition":"p0","event_time":1700000012000,"offset":3}"#,
            r#"{"partition":"p1","event_time":"2023-11-14T22:13:25Z","offset":"a"}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let mut cfg = RunConfig::default();
        cfg.engine.scheduler.fire_interval = "10ms".into();
        cfg.engine.buffer.auto_flush_interval = "10ms".into();
        let rows = run_replay(cfg, &path, Arc::new(NoopObserver), Duration::from_secs(5))
            .await
            .unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(rows.len(), 3);
        let p0: Vec<u64> = rows
            .iter()
            .filter(|r| r["partition"] == "p0")
            .map(|r| r["count"].as_u64().unwrap())
            .collect();
        assert_eq!(p0, vec![2, 1]);
        let first_p0 = rows.iter().find(|r| r["partition"] == "p0").unwrap();
        assert_eq!(first_p0["offsets"]["p0"], "1");
    }
}
