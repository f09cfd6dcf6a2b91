//! Pipeline wiring: reader pool, merger task, maintenance loop and
//! metrics publisher loop.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use brine_data::DataMerger;
use brine_events::{EventParser, EventRecord};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::ipc::MetricsPublisher;
use crate::source::RawEvent;

/// Cadence of the completed-jid cleanup check.
const JIDS_CLEANUP_INTERVAL: u64 = 30;
/// Publisher loop cadence.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(3);
/// Republish at least this often even without an epoch change.
const PUBLISH_FORCE_AFTER: Duration = Duration::from_secs(110);

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Spawn the reader pool. Each reader owns its parser with its own
/// compiled rules and stamps records with its index. Readers drain the raw
/// queue until it closes.
pub fn spawn_readers(
    config: &Config,
    raw_rx: flume::Receiver<RawEvent>,
    parsed_tx: flume::Sender<EventRecord>,
) -> Result<Vec<JoinHandle<()>>> {
    let sls_rules = config.sls_rename_pairs();
    let sid_rules = config.sid_rename_pairs();
    let mut handles = Vec::with_capacity(config.readers_subprocesses);
    for rix in 0..config.readers_subprocesses {
        let parser = EventParser::new(&sls_rules, &sid_rules)?;
        let raw_rx = raw_rx.clone();
        let parsed_tx = parsed_tx.clone();
        handles.push(tokio::spawn(async move {
            info!("Running events reader: {}", rix);
            while let Ok(event) = raw_rx.recv_async().await {
                if let Some(mut record) = parser.parse(&event.tag, &event.data) {
                    record.rix = Some(rix);
                    if parsed_tx.send_async(record).await.is_err() {
                        break;
                    }
                }
            }
        }));
    }
    Ok(handles)
}

/// Spawn the merger task: the single consumer of the parsed queue. Drains
/// until the queue closes.
pub fn spawn_merger(
    merger: Arc<DataMerger>,
    parsed_rx: flume::Receiver<EventRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Running data merger");
        while let Ok(record) = parsed_rx.recv_async().await {
            merger.add(record);
        }
    })
}

/// Spawn the maintenance loop: a 1 s tick driving three schedules — job
/// timeouts, gauge recomputation and completed-jid cleanup. Observes the
/// stop flag within one tick.
pub fn spawn_maintenance(
    merger: Arc<DataMerger>,
    config: &Config,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let timeout_check_interval = config.job_timeout_check_interval as f64;
    let job_timeout = config.job_timeout as f64;
    let metrics_update_interval = config.job_metrics_update_interval as f64;
    let cleanup_interval = JIDS_CLEANUP_INTERVAL as f64;

    tokio::spawn(async move {
        let ts = now_ts();
        let mut run_timeout_after = ts + timeout_check_interval;
        let mut run_metrics_after = ts + metrics_update_interval;
        let mut run_cleanup_after = ts + cleanup_interval;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let ts = now_ts();
                    if ts > run_timeout_after {
                        run_timeout_after = ts + timeout_check_interval;
                        merger.complete_with_timeout(job_timeout, ts);
                    }
                    if ts > run_metrics_after {
                        run_metrics_after = ts + metrics_update_interval;
                        merger.jobs_metrics_update();
                    }
                    if ts > run_cleanup_after {
                        run_cleanup_after = ts + cleanup_interval;
                        merger.cleanup_job_jids();
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

/// Spawn the publisher loop: compare the store epoch every few seconds and
/// push a freshly serialized buffer on change, or at the latest after the
/// force interval.
pub fn spawn_publisher(
    merger: Arc<DataMerger>,
    publisher: MetricsPublisher,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_epoch: Option<u64> = None;
        let mut last_update = Instant::now();
        let mut tick = tokio::time::interval(PUBLISH_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let epoch = merger.get_metrics_epoch();
                    if last_epoch != Some(epoch) || last_update.elapsed() > PUBLISH_FORCE_AFTER {
                        last_epoch = Some(epoch);
                        last_update = Instant::now();
                        publisher.publish(&merger.get_metrics()).await;
                    }
                }
                _ = stop.changed() => break,
            }
        }
        if let Err(e) = tokio::time::timeout(Duration::from_secs(1), async {
            publisher.publish(&merger.get_metrics()).await;
        })
        .await
        {
            warn!("Final metrics publish timed out: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestApiConfig;
    use brine_data::MergerOptions;
    use serde_json::json;

    fn test_config() -> Config {
        Config {
            readers_subprocesses: 3,
            restapi: RestApiConfig {
                disable_ssl: true,
                ..RestApiConfig::default()
            },
            ..Config::default()
        }
    }

    fn sample(buf: &str, name: &str, needles: &[&str]) -> Option<f64> {
        buf.lines()
            .filter(|l| l.starts_with(name) && needles.iter().all(|n| l.contains(n)))
            .filter_map(|l| l.rsplit_once(' ').and_then(|(_, v)| v.parse().ok()))
            .next()
    }

    #[tokio::test]
    async fn records_flow_from_raw_queue_to_metrics() {
        let config = test_config();
        let merger = Arc::new(DataMerger::new(MergerOptions::default()));
        let (raw_tx, raw_rx) = flume::bounded(64);
        let (parsed_tx, parsed_rx) = flume::bounded(64);

        let readers = spawn_readers(&config, raw_rx, parsed_tx).unwrap();
        let merger_task = spawn_merger(merger.clone(), parsed_rx);

        let events = [
            (
                "salt/job/20240101000000000001/new",
                json!({
                    "fun": "state.apply",
                    "arg": ["web"],
                    "minions": ["m1", "m2"],
                    "jid": "20240101000000000001",
                    "_stamp": "2024-01-01T00:00:00.000000"
                }),
            ),
            (
                "salt/job/20240101000000000001/ret/m1",
                json!({
                    "fun": "state.apply",
                    "fun_args": ["web"],
                    "id": "m1",
                    "jid": "20240101000000000001",
                    "retcode": 0,
                    "success": true,
                    "return": {
                        "pkg_|-nginx_|-nginx_|-installed": {
                            "result": true,
                            "duration": "12.5 ms",
                            "__sls__": "web/server",
                            "__id__": "nginx"
                        }
                    },
                    "_stamp": "2024-01-01T00:00:05.000000"
                }),
            ),
        ];
        for (tag, data) in events {
            raw_tx
                .send_async(RawEvent {
                    tag: tag.to_string(),
                    data,
                })
                .await
                .unwrap();
        }
        // Closing the raw queue drains the pipeline in order.
        drop(raw_tx);
        for handle in readers {
            handle.await.unwrap();
        }
        merger_task.await.unwrap();

        let buf = merger.get_metrics();
        assert_eq!(sample(&buf, "salt_events_total", &[]), Some(2.0));
        assert_eq!(sample(&buf, "salt_state_applies ", &[]), Some(1.0));
        assert_eq!(
            sample(
                &buf,
                "salt_state_results{",
                &["sls=\"web.server\"", "status=\"succeeded\""]
            ),
            Some(1.0)
        );
        // Reader indexes were attached.
        assert_eq!(
            buf.lines()
                .filter(|l| l.starts_with("brine_internal_rix_total{"))
                .filter_map(|l| l.rsplit_once(' ').and_then(|(_, v)| v.parse::<f64>().ok()))
                .sum::<f64>(),
            2.0
        );
    }

    #[tokio::test]
    async fn maintenance_observes_stop_within_a_tick() {
        let config = test_config();
        let merger = Arc::new(DataMerger::new(MergerOptions::default()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_maintenance(merger, &config, stop_rx);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("maintenance did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn publisher_publishes_on_epoch_change() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = MetricsPublisher::bind(dir.path(), 0).await.unwrap();
        let buf = Arc::new(tokio::sync::RwLock::new(None));
        let (stop_tx, stop_rx) = watch::channel(false);
        let _sub = crate::ipc::spawn_subscriber(
            dir.path().join(crate::ipc::PUBLISHER_SOCKET),
            buf.clone(),
            stop_rx.clone(),
        );
        for _ in 0..50 {
            if publisher.subscriber_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let merger = Arc::new(DataMerger::new(MergerOptions::default()));
        let handle = spawn_publisher(merger.clone(), publisher, stop_rx);

        for _ in 0..100 {
            if buf.read().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let published = buf.read().await.clone().expect("nothing published");
        assert!(published.starts_with("# HELP salt_events_total"));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
