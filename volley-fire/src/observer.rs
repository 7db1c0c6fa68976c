//! Built-in diagnostic sinks for in-flight transitions.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use volley_core::{FireObserver, WindowInstance};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl FireObserver for NoopObserver {
    async fn on_in_flight(&self, _instance: &WindowInstance, _last_update: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every in-flight transition at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl FireObserver for TracingObserver {
    async fn on_in_flight(&self, instance: &WindowInstance, last_update: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        debug!(
            instance_id = %instance.instance_id(),
            partition = %instance.partition,
            fire_time = %instance.fire_time,
            last_update = ?last_update,
            "window instance in flight"
        );
        Ok(())
    }
}

/// Appends one JSON line per in-flight transition to a file.
#[derive(Debug, Clone)]
pub struct JsonlObserver {
    pub path: PathBuf,
}

impl JsonlObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FireObserver for JsonlObserver {
    async fn on_in_flight(&self, instance: &WindowInstance, last_update: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let line = serde_json::to_string(&serde_json::json!({
            "instance_id": instance.instance_id(),
            "partition": instance.partition,
            "namespace": instance.namespace,
            "window_name": instance.window_name,
            "start_time": instance.start_time,
            "end_time": instance.end_time,
            "fire_time": instance.fire_time,
            "last_update_time": last_update,
        }))?;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("volley_test_{}_{}.jsonl", name, nanos));
        p
    }

    #[tokio::test]
    async fn jsonl_observer_appends_lines() {
        let path = tmp_file("observer");
        let obs = JsonlObserver::new(&path);
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let w = WindowInstance::new("q-0", "ns", "w", t0, t0 + chrono::Duration::seconds(60));
        obs.on_in_flight(&w, Some(t0)).await.unwrap();
        obs.on_in_flight(&w, None).await.unwrap();

        let data = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = data.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["instance_id"], serde_json::json!(w.instance_id()));
        assert_eq!(first["partition"], serde_json::json!("q-0"));
        assert!(lines[1].contains("\"last_update_time\":null"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn jsonl_observer_reports_io_errors() {
        let obs = JsonlObserver::new(std::env::temp_dir().join("volley-missing-dir").join("x").join("y.jsonl"));
        let t0 = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let w = WindowInstance::new("q", "ns", "w", t0, t0);
        assert!(obs.on_in_flight(&w, None).await.is_err());
    }
}
