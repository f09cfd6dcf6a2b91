//! Event source — tails the master event bus and feeds the raw queue.
//!
//! The bus is reached over a Unix socket carrying newline-delimited JSON
//! `{tag, data}` frames. Read failures reconnect with backoff; tags are
//! filtered against the configured allowlist before entering the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use brine_events::parser::compile_anchored;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One raw event as published on the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub tag: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Tag allowlist: the primary filter plus the additional patterns.
pub struct EventFilter {
    primary: Regex,
    additional: Vec<Regex>,
}

impl EventFilter {
    pub fn new(primary: &str, additional: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            primary: compile_anchored(primary)?,
            additional: additional
                .iter()
                .map(|p| compile_anchored(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.primary.is_match(tag) || self.additional.iter().any(|p| p.is_match(tag))
    }
}

/// Producer task: read events from the bus socket and enqueue matching
/// ones until the stop flag flips or the queue closes.
pub async fn run_source(
    socket: PathBuf,
    filter: EventFilter,
    raw_tx: flume::Sender<RawEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }
        let stream = tokio::select! {
            connected = UnixStream::connect(&socket) => match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not connect to the event bus at {}: {}", socket.display(), e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = stop.changed() => return,
                    }
                }
            },
            _ = stop.changed() => return,
        };
        info!("Reading events from {}", socket.display());

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = stop.changed() => return,
            };
            match line {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let event: RawEvent = match serde_json::from_str(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("Skipping malformed event frame: {}", e);
                            continue;
                        }
                    };
                    if !filter.matches(&event.tag) {
                        debug!("The event tag doesn't match the event filter: {}", event.tag);
                        continue;
                    }
                    if raw_tx.send_async(event).await.is_err() {
                        // The pipeline is gone; nothing left to feed.
                        return;
                    }
                }
                Ok(None) => {
                    warn!("Event bus connection closed, reconnecting");
                    break;
                }
                Err(e) => {
                    warn!("Event bus read failed, reconnecting: {}", e);
                    break;
                }
            }
        }
    }
}
