//! Per-minion store: request/response/offline bookkeeping and activity
//! stats.

use std::collections::HashMap;
use std::sync::Mutex;

use brine_events::{Jid, StateFunArgs};
use tracing::warn;

use crate::state::JobStatus;

/// A jid drained from a minion's pending set when it went offline. The
/// state-job key is a plain identifier; the caller resolves it against the
/// state job collection.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflinePending {
    pub minion: String,
    pub jid: Jid,
    pub key: StateFunArgs,
}

#[derive(Debug, Default)]
struct Minion {
    name: String,
    /// Last time the minion itself was seen (response, auth, start,
    /// refresh) — the source for the active_* buckets.
    seen_last: Option<f64>,
    request_last: Option<f64>,
    request_count: u64,
    response_last: Option<f64>,
    response_count: u64,
    offline_last: Option<f64>,
    offline_count: u64,
    updates: u64,
    /// jid → (state job key, request ts); a jid lives in at most one of
    /// the three maps at any instant.
    pending_jobs: HashMap<Jid, (StateFunArgs, f64)>,
    /// jid → (return count, last return ts).
    completed_jobs: HashMap<Jid, (u64, f64)>,
    offline_jobs: HashMap<Jid, (StateFunArgs, f64)>,
}

fn ts_max(current: Option<f64>, ts: f64) -> Option<f64> {
    Some(current.map_or(ts, |c| c.max(ts)))
}

impl Minion {
    fn new(name: &str) -> Self {
        Minion {
            name: name.to_string(),
            ..Minion::default()
        }
    }

    fn touch(&mut self, ts: f64) {
        self.seen_last = ts_max(self.seen_last, ts);
    }

    fn update(&mut self, ts: f64, status: JobStatus, jid: Option<&Jid>, job: Option<&StateFunArgs>) {
        match status {
            JobStatus::New => {
                self.request_last = ts_max(self.request_last, ts);
                self.request_count += 1;
                if let (Some(jid), Some(key)) = (jid, job) {
                    self.pending_jobs
                        .entry(jid.clone())
                        .or_insert_with(|| (key.clone(), ts));
                }
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                self.response_last = ts_max(self.response_last, ts);
                self.response_count += 1;
                self.seen_last = ts_max(self.seen_last, ts);
                if let Some(jid) = jid {
                    self.pending_jobs.remove(jid);
                    match self.completed_jobs.get_mut(jid) {
                        Some(entry) => {
                            warn!(
                                "Duplicated return from '{}' on jid: {} after {:.3} seconds",
                                self.name,
                                jid,
                                ts - entry.1
                            );
                            entry.0 += 1;
                            entry.1 = entry.1.max(ts);
                        }
                        None => {
                            self.completed_jobs.insert(jid.clone(), (1, ts));
                        }
                    }
                }
            }
        }
        self.updates += 1;
    }

    fn offline(&mut self, ts: f64) -> Vec<(Jid, StateFunArgs)> {
        self.offline_last = ts_max(self.offline_last, ts);
        self.offline_count += 1;
        let drained: Vec<(Jid, (StateFunArgs, f64))> = self.pending_jobs.drain().collect();
        let mut pending = Vec::with_capacity(drained.len());
        for (jid, entry) in drained {
            pending.push((jid.clone(), entry.0.clone()));
            self.offline_jobs.insert(jid, entry);
        }
        pending
    }

    fn cleanup_jid(&mut self, jid: &Jid) {
        self.completed_jobs.remove(jid);
        self.pending_jobs.remove(jid);
        self.offline_jobs.remove(jid);
    }

    fn is_offline(&self) -> bool {
        match self.offline_last {
            Some(off) => self.response_last.is_none_or(|resp| off > resp),
            None => false,
        }
    }
}

/// Stat bucket names in metric emission order.
pub const MINION_STAT_KEYS: &[&str] = &[
    "seen",
    "active_1m",
    "active_5m",
    "active_15m",
    "active_1h",
    "active_24h",
    "active_ever",
    "active_never",
    "offline",
];

/// The minion store. One lock for the whole collection; the merger is the
/// single writer and readers only snapshot briefly.
#[derive(Default)]
pub struct MinionsCollection {
    inner: Mutex<HashMap<String, Minion>>,
}

impl MinionsCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the minions were seen alive, creating entries on first
    /// mention.
    pub fn touch(&self, minions: &[String], ts: f64) {
        let mut map = self.inner.lock().unwrap();
        for name in minions {
            map.entry(name.clone())
                .or_insert_with(|| Minion::new(name))
                .touch(ts);
        }
    }

    /// Apply a request or response to each minion.
    pub fn update(
        &self,
        minions: &[String],
        ts: f64,
        status: JobStatus,
        jid: Option<&Jid>,
        job: Option<&StateFunArgs>,
    ) {
        let mut map = self.inner.lock().unwrap();
        for name in minions {
            map.entry(name.clone())
                .or_insert_with(|| Minion::new(name))
                .update(ts, status, jid, job);
        }
    }

    /// Mark minions offline, draining their pending jobs. The caller
    /// routes the returned entries through the state job collection.
    pub fn offline(&self, minions: &[String], ts: f64) -> Vec<OfflinePending> {
        let mut map = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for name in minions {
            let minion = map
                .entry(name.clone())
                .or_insert_with(|| Minion::new(name));
            for (jid, key) in minion.offline(ts) {
                out.push(OfflinePending {
                    minion: name.clone(),
                    jid,
                    key,
                });
            }
        }
        out
    }

    /// Forget a jid in one minion's per-jid maps (cleanup pass).
    pub fn cleanup_jid(&self, minion: &str, jid: &Jid) {
        let mut map = self.inner.lock().unwrap();
        if let Some(minion) = map.get_mut(minion) {
            minion.cleanup_jid(jid);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_pending(&self, minion: &str, jid: &Jid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(minion)
            .is_some_and(|m| m.pending_jobs.contains_key(jid))
    }

    pub fn completed_returns(&self, minion: &str, jid: &Jid) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .get(minion)
            .and_then(|m| m.completed_jobs.get(jid))
            .map(|entry| entry.0)
    }

    /// Snapshot the activity buckets, keyed per `MINION_STAT_KEYS`.
    pub fn stats(&self, ts: f64) -> Vec<(&'static str, i64)> {
        let map = self.inner.lock().unwrap();
        let seen = map.len() as i64;
        let mut active = [0i64; 5];
        let mut active_ever = 0i64;
        let mut offline = 0i64;
        for minion in map.values() {
            if minion.is_offline() {
                offline += 1;
            }
            if let Some(seen_last) = minion.seen_last {
                let age = ts - seen_last;
                for (slot, limit) in active
                    .iter_mut()
                    .zip([60.0, 300.0, 900.0, 3600.0, 86400.0])
                {
                    if age <= limit {
                        *slot += 1;
                    }
                }
                active_ever += 1;
            }
        }
        vec![
            ("seen", seen),
            ("active_1m", active[0]),
            ("active_5m", active[1]),
            ("active_15m", active[2]),
            ("active_1h", active[3]),
            ("active_24h", active[4]),
            ("active_ever", active_ever),
            ("active_never", seen - active_ever),
            ("offline", offline),
        ]
    }
}
