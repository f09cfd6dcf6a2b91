//! State job stores: per-jid salt jobs and their per-state aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use brine_events::{Jid, StateFunArgs};

/// Status attached to a job update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    New,
    Succeeded,
    Failed,
}

/// One dispatched job (a single jid) within a state job: the targeted
/// minions and which of them answered or timed out.
#[derive(Debug, Default)]
struct SaltJob {
    req_ts: Option<f64>,
    last_resp_ts: Option<f64>,
    minions: HashSet<String>,
    done: HashMap<String, f64>,
    timeout: HashMap<String, f64>,
}

impl SaltJob {
    fn update(&mut self, minions: &[String], ts: f64, status: JobStatus) {
        self.minions.extend(minions.iter().cloned());
        match status {
            JobStatus::New => self.req_ts = Some(ts),
            JobStatus::Succeeded | JobStatus::Failed => {
                self.last_resp_ts = Some(ts);
                for minion in minions {
                    self.timeout.remove(minion);
                    self.done.insert(minion.clone(), ts);
                }
            }
        }
    }

    /// Completion predicate: every targeted minion answered or timed out.
    fn completed(&self) -> bool {
        self.minions.len() == self.done.len() + self.timeout.len()
    }

    /// Move the minion to the timeout set unless it already answered.
    fn mark_timeout(&mut self, minion: &str, ts: f64) -> bool {
        if self.done.contains_key(minion) {
            return false;
        }
        self.timeout.insert(minion.to_string(), ts);
        true
    }

    fn pending_minions(&self) -> Vec<String> {
        self.minions
            .iter()
            .filter(|m| !self.done.contains_key(*m) && !self.timeout.contains_key(*m))
            .cloned()
            .collect()
    }
}

/// Stat keys exported per state job, in metric emission order.
pub const STATE_JOB_STAT_KEYS: &[&str] = &[
    "pending_jids",
    "completed_jids",
    "targeted",
    "pending",
    "succeeded",
    "failed",
    "timedout",
    "ever_succeeded",
    "ever_failed",
    "ever_timedout",
    "all_succeeded",
    "all_failed",
    "all_timedout",
];

/// Aggregation of all jobs sharing one `StateFunArgs` key.
#[derive(Debug, Default)]
struct StateJob {
    jids: HashMap<Jid, SaltJob>,
    completed_jids: HashMap<Jid, (SaltJob, f64)>,
    completed_jids_count: u64,
    targets: HashSet<String>,
    succeeded: HashMap<String, f64>,
    failed: HashMap<String, f64>,
    timedout: HashMap<String, f64>,
    ever_succeeded: HashSet<String>,
    ever_failed: HashSet<String>,
    ever_timedout: HashSet<String>,
    /// minion → set of jids with an outstanding request.
    pending: HashMap<String, HashSet<Jid>>,
}

impl StateJob {
    fn update(&mut self, minions: &[String], status: JobStatus, jid: Option<&Jid>, ts: f64) {
        if let Some(jid) = jid {
            // Look up completed jids first: a late NEW for a finished job
            // must not resurrect it, and a RET seen before its NEW still
            // lands on one job.
            if let Some(entry) = self.completed_jids.get_mut(jid) {
                entry.0.update(minions, ts, status);
                if status != JobStatus::New && entry.0.completed() {
                    entry.1 = ts;
                }
            } else {
                let job = self.jids.entry(jid.clone()).or_default();
                job.update(minions, ts, status);
                if status != JobStatus::New && job.completed() {
                    if let Some(job) = self.jids.remove(jid) {
                        let completed_ts = job.last_resp_ts.unwrap_or(ts);
                        self.completed_jids.insert(jid.clone(), (job, completed_ts));
                    }
                }
            }
        }

        self.targets.extend(minions.iter().cloned());
        match status {
            JobStatus::Succeeded => {
                for minion in minions {
                    self.succeeded.insert(minion.clone(), ts);
                    self.failed.remove(minion);
                    self.timedout.remove(minion);
                    self.ever_succeeded.insert(minion.clone());
                }
            }
            JobStatus::Failed => {
                for minion in minions {
                    self.failed.insert(minion.clone(), ts);
                    self.succeeded.remove(minion);
                    self.timedout.remove(minion);
                    self.ever_failed.insert(minion.clone());
                }
            }
            JobStatus::New => {
                if let Some(jid) = jid {
                    for minion in minions {
                        self.pending
                            .entry(minion.clone())
                            .or_default()
                            .insert(jid.clone());
                    }
                }
            }
        }
        if status != JobStatus::New {
            if let Some(jid) = jid {
                for minion in minions {
                    self.discard_pending(minion, jid);
                }
            }
        }
    }

    fn discard_pending(&mut self, minion: &str, jid: &Jid) {
        if let Some(set) = self.pending.get_mut(minion) {
            set.remove(jid);
            if set.is_empty() {
                self.pending.remove(minion);
            }
        }
    }

    /// Per-state bookkeeping once a minion timed out on a jid.
    fn note_timeout(&mut self, jid: &Jid, minion: &str, ts: f64) {
        self.timedout.insert(minion.to_string(), ts);
        if self.pending.contains_key(minion) {
            self.discard_pending(minion, jid);
            self.succeeded.remove(minion);
            self.failed.remove(minion);
        }
        self.ever_timedout.insert(minion.to_string());
    }

    fn timeout_minion(&mut self, jid: &Jid, minion: &str, ts: f64) {
        if let Some(job) = self.jids.get_mut(jid) {
            if !job.mark_timeout(minion, ts) {
                return;
            }
            let completed = job.completed();
            self.note_timeout(jid, minion, ts);
            if completed {
                if let Some(job) = self.jids.remove(jid) {
                    self.completed_jids.insert(jid.clone(), (job, ts));
                }
            }
        } else if let Some(entry) = self.completed_jids.get_mut(jid) {
            if entry.0.mark_timeout(minion, ts) {
                entry.1 = ts;
                self.note_timeout(jid, minion, ts);
            }
        }
    }

    /// Force-complete jobs whose request is older than `before`.
    fn complete_with_timeout(&mut self, before: f64, ts: f64) {
        let jids: Vec<Jid> = self.jids.keys().cloned().collect();
        for jid in jids {
            let pending = match self.jids.get(&jid) {
                Some(job) => {
                    if job.req_ts.is_some_and(|req| req > before) {
                        continue;
                    }
                    job.pending_minions()
                }
                None => continue,
            };
            for minion in pending {
                self.timeout_minion(&jid, &minion, ts);
            }
        }
    }

    /// Drop completed jids older than the cutoff; returns the removed jids
    /// with their participating minions so the minion store can forget
    /// them too.
    fn cleanup_jids(&mut self, cutoff: f64) -> Vec<(Jid, Vec<String>)> {
        let expired: Vec<Jid> = self
            .completed_jids
            .iter()
            .filter(|(_, (_, completed_ts))| *completed_ts <= cutoff)
            .map(|(jid, _)| jid.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for jid in expired {
            if let Some((job, _)) = self.completed_jids.remove(&jid) {
                self.completed_jids_count += 1;
                removed.push((jid, job.minions.into_iter().collect()));
            }
        }
        removed
    }

    fn stats(&self) -> Vec<(&'static str, i64)> {
        let disjoint = |own: &HashSet<String>, other1: &HashSet<String>, other2: &HashSet<String>| {
            own.iter()
                .filter(|m| !other1.contains(*m) && !other2.contains(*m))
                .count() as i64
        };
        vec![
            ("pending_jids", self.jids.len() as i64),
            ("completed_jids", self.completed_jids.len() as i64),
            ("targeted", self.targets.len() as i64),
            ("pending", self.pending.len() as i64),
            ("succeeded", self.succeeded.len() as i64),
            ("failed", self.failed.len() as i64),
            ("timedout", self.timedout.len() as i64),
            ("ever_succeeded", self.ever_succeeded.len() as i64),
            ("ever_failed", self.ever_failed.len() as i64),
            ("ever_timedout", self.ever_timedout.len() as i64),
            (
                "all_succeeded",
                disjoint(&self.ever_succeeded, &self.ever_failed, &self.ever_timedout),
            ),
            (
                "all_failed",
                disjoint(&self.ever_failed, &self.ever_succeeded, &self.ever_timedout),
            ),
            (
                "all_timedout",
                disjoint(&self.ever_timedout, &self.ever_succeeded, &self.ever_failed),
            ),
        ]
    }
}

/// All state jobs, keyed by `StateFunArgs`. One lock per collection.
#[derive(Default)]
pub struct StateJobCollection {
    inner: Mutex<HashMap<StateFunArgs, StateJob>>,
}

impl StateJobCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &self,
        key: &StateFunArgs,
        minions: &[String],
        status: JobStatus,
        jid: Option<&Jid>,
        ts: f64,
    ) {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.clone())
            .or_default()
            .update(minions, status, jid, ts);
    }

    /// Route a timeout for one `(jid, minion)` pair to its state job.
    pub fn timeout_minion(&self, key: &StateFunArgs, jid: &Jid, minion: &str, ts: f64) {
        let mut map = self.inner.lock().unwrap();
        if let Some(job) = map.get_mut(key) {
            job.timeout_minion(jid, minion, ts);
        }
    }

    /// Time out every pending jid requested at or before `ts - timeout`.
    pub fn complete_with_timeout(&self, timeout: f64, ts: f64) {
        let before = ts - timeout;
        let mut map = self.inner.lock().unwrap();
        for job in map.values_mut() {
            job.complete_with_timeout(before, ts);
        }
    }

    /// Remove jids completed at or before `ts - cleanup_after`. Returns
    /// the removed jids and their minions for the minion store cleanup.
    pub fn cleanup_jids(&self, cleanup_after: f64, ts: f64) -> Vec<(Jid, Vec<String>)> {
        let cutoff = ts - cleanup_after;
        let mut map = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        for job in map.values_mut() {
            removed.extend(job.cleanup_jids(cutoff));
        }
        removed
    }

    /// Snapshot per-job stats for the gauge update.
    pub fn stats(&self) -> Vec<(StateFunArgs, Vec<(&'static str, i64)>)> {
        let map = self.inner.lock().unwrap();
        map.iter()
            .map(|(key, job)| (key.clone(), job.stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
