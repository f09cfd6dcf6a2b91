//! Internal publisher channel.
//!
//! The merger-side publisher owns `{sock_dir}/publisher.ipc` and writes one
//! JSON frame `{"metrics": …}` per publish to every connected subscriber.
//! The REST side subscribes and keeps the most recent buffer; serialization
//! cost is paid once per change, never on the request path.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const PUBLISHER_SOCKET: &str = "publisher.ipc";

const SUBSCRIBE_RETRIES: usize = 5;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    metrics: String,
}

/// Publisher side of the channel.
#[derive(Debug)]
pub struct MetricsPublisher {
    subscribers: Arc<Mutex<Vec<BufWriter<UnixStream>>>>,
}

impl MetricsPublisher {
    /// Bind the publisher socket. A live socket means another instance is
    /// running; a stale file is removed.
    pub async fn bind(sock_dir: &Path, write_buffer: usize) -> Result<MetricsPublisher> {
        let path = sock_dir.join(PUBLISHER_SOCKET);
        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(_) => bail!("An instance is already running on {}", path.display()),
                Err(_) => {
                    std::fs::remove_file(&path).with_context(|| {
                        format!("Could not remove stale socket {}", path.display())
                    })?;
                }
            }
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Could not bind publisher socket {}", path.display()))?;
        // Owner-only, like the rest of the runtime directory content.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Could not set permissions on {}", path.display()))?;

        let subscribers: Arc<Mutex<Vec<BufWriter<UnixStream>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_subs = subscribers.clone();
        let capacity = if write_buffer > 0 { write_buffer } else { 8192 };
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        debug!("Metrics subscriber connected");
                        accept_subs
                            .lock()
                            .await
                            .push(BufWriter::with_capacity(capacity, stream));
                    }
                    Err(e) => {
                        warn!("Publisher accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        info!("Publishing metrics on {}", path.display());
        Ok(MetricsPublisher { subscribers })
    }

    /// Push one serialized buffer to every subscriber, dropping the dead
    /// ones.
    pub async fn publish(&self, metrics: &str) {
        let frame = match serde_json::to_string(&Frame {
            metrics: metrics.to_string(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Could not encode metrics frame: {}", e);
                return;
            }
        };
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        for mut stream in subscribers.drain(..) {
            let write = async {
                stream.write_all(frame.as_bytes()).await?;
                stream.write_all(b"\n").await?;
                stream.flush().await
            };
            match write.await {
                Ok(()) => alive.push(stream),
                Err(e) => debug!("Dropping metrics subscriber: {}", e),
            }
        }
        *subscribers = alive;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

/// Subscriber task for the REST side: connect (with retries), then keep
/// the shared buffer at the latest published frame.
pub fn spawn_subscriber(
    socket: PathBuf,
    buf: Arc<RwLock<Option<String>>>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        'reconnect: while !*stop.borrow() {
            let mut stream = None;
            for _ in 0..SUBSCRIBE_RETRIES {
                match UnixStream::connect(&socket).await {
                    Ok(connected) => {
                        stream = Some(connected);
                        break;
                    }
                    Err(_) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = stop.changed() => return,
                        }
                    }
                }
            }
            let Some(stream) = stream else {
                error!(
                    "Could not connect to the metrics publisher at {}",
                    socket.display()
                );
                return;
            };
            debug!("Subscribed to metrics publisher");

            let mut lines = BufReader::new(stream).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    _ = stop.changed() => return,
                };
                match line {
                    Ok(Some(line)) => match serde_json::from_str::<Frame>(&line) {
                        Ok(frame) => {
                            *buf.write().await = Some(frame.metrics);
                        }
                        Err(e) => debug!("Skipping malformed metrics frame: {}", e),
                    },
                    Ok(None) | Err(_) => {
                        warn!("Metrics publisher connection lost, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = MetricsPublisher::bind(dir.path(), 0).await.unwrap();

        let buf = Arc::new(RwLock::new(None));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _sub = spawn_subscriber(
            dir.path().join(PUBLISHER_SOCKET),
            buf.clone(),
            stop_rx,
        );

        // Wait for the subscriber to be accepted before publishing.
        for _ in 0..50 {
            if publisher.subscriber_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        publisher.publish("# HELP salt_events_total x\n").await;

        for _ in 0..50 {
            if buf.read().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            buf.read().await.as_deref(),
            Some("# HELP salt_events_total x\n")
        );
    }

    #[tokio::test]
    async fn second_bind_detects_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let _publisher = MetricsPublisher::bind(dir.path(), 0).await.unwrap();
        let err = MetricsPublisher::bind(dir.path(), 0).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PUBLISHER_SOCKET);
        // A leftover socket file nobody listens on.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        let publisher = MetricsPublisher::bind(dir.path(), 0).await;
        assert!(publisher.is_ok());
    }

    #[tokio::test]
    async fn newline_in_metrics_survives_framing() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = MetricsPublisher::bind(dir.path(), 0).await.unwrap();
        let buf = Arc::new(RwLock::new(None));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _sub = spawn_subscriber(dir.path().join(PUBLISHER_SOCKET), buf.clone(), stop_rx);
        for _ in 0..50 {
            if publisher.subscriber_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let body = "# HELP a b\n# TYPE a counter\na 1\n";
        publisher.publish(body).await;
        for _ in 0..50 {
            if buf.read().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(buf.read().await.as_deref(), Some(body));
    }
}
