//! Data merger — the single writer consuming canonical event records and
//! updating the metrics, minion and state job stores.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use brine_events::{EventRecord, TagMain, TagSub};
use brine_metrics::{MetricId, MetricValue, MetricsCollection};
use tracing::{debug, error, info, warn};

use crate::merge::{MergeOutcome, SmartMerger};
use crate::minion::MinionsCollection;
use crate::now_ts;
use crate::state::{JobStatus, StateJobCollection};

/// Functions whose job events carry state apply semantics.
const STATE_FUNCS: &[&str] = &[
    "state.apply",
    "state.high",
    "state.highstate",
    "state.low",
    "state.pkg",
    "state.template",
    "state.template_str",
    "state.test",
    "state.top",
    "state.single",
    "state.sls",
    "state.sls_id",
];

/// Metrics migrated when an sls/sid label is rewritten.
const MIGRATED_METRICS: &[MetricId] = &[MetricId::SaltStateResults, MetricId::SaltStateDuration];

/// Match quality the sls/sid label mergers run at, stricter than the
/// engine default.
const LABEL_MATCH_QUALITY: f64 = 0.7;

/// Tunables for the merger.
#[derive(Debug, Clone)]
pub struct MergerOptions {
    /// Auto-merge threshold for the sls label dimension.
    pub sls_start_merging_on: usize,
    /// Auto-merge threshold for the sid label dimension.
    pub sid_start_merging_on: usize,
    /// Placeholder for an empty mods label in `salt_state_jobs`.
    pub highstate_mods: String,
    /// Age in seconds after which completed jids are pruned.
    pub job_cleanup_after: f64,
}

impl Default for MergerOptions {
    fn default() -> Self {
        Self {
            sls_start_merging_on: 70,
            sid_start_merging_on: 150,
            highstate_mods: String::new(),
            job_cleanup_after: 1200.0,
        }
    }
}

/// Populated sids under one sls key: sid → fun → statuses.
struct SidLevel {
    merger: SmartMerger,
    entries: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl SidLevel {
    fn new(start_merging_on: usize) -> Self {
        Self {
            merger: SmartMerger::with_match_quality(start_merging_on, LABEL_MATCH_QUALITY),
            entries: HashMap::new(),
        }
    }
}

/// The two nested label dimensions: sls wrapping a per-sls sid level.
struct LabelSpace {
    merger: SmartMerger,
    levels: HashMap<String, SidLevel>,
}

/// The data merger. All mutation goes through `&self`; the stores carry
/// their own locks so readers (serializer, maintenance) can snapshot
/// concurrently.
pub struct DataMerger {
    metrics: MetricsCollection,
    minions: MinionsCollection,
    jobs: StateJobCollection,
    labels: Mutex<LabelSpace>,
    opts: MergerOptions,
}

impl DataMerger {
    pub fn new(opts: MergerOptions) -> Self {
        Self {
            metrics: MetricsCollection::new(),
            minions: MinionsCollection::new(),
            jobs: StateJobCollection::new(),
            labels: Mutex::new(LabelSpace {
                merger: SmartMerger::with_match_quality(
                    opts.sls_start_merging_on,
                    LABEL_MATCH_QUALITY,
                ),
                levels: HashMap::new(),
            }),
            opts,
        }
    }

    pub fn minions(&self) -> &MinionsCollection {
        &self.minions
    }

    pub fn jobs(&self) -> &StateJobCollection {
        &self.jobs
    }

    /// Serialized metrics buffer.
    pub fn get_metrics(&self) -> String {
        self.metrics.get_buf()
    }

    pub fn get_metrics_epoch(&self) -> u64 {
        self.metrics.get_epoch()
    }

    /// Consume one record.
    pub fn add(&self, data: EventRecord) {
        let ts = data.ts;

        if let Some(rix) = data.rix {
            self.inc(MetricId::InternalRixTotal, &[&rix.to_string()]);
        }
        self.inc_plain(MetricId::SaltEventsTotal);
        self.inc(MetricId::SaltEventsTags, &[&data.tag_mask]);

        // Any event carrying the minion as actor counts as the minion
        // being seen.
        if let Some(id) = &data.id {
            self.minions.touch(std::slice::from_ref(id), ts);
        }

        match data.fun.as_deref() {
            Some(fun) => {
                self.inc(MetricId::SaltEventsTagsFuncs, &[&data.tag_mask, fun]);
                if data.tag_main == Some(TagMain::Job)
                    && matches!(data.tag_sub, Some(TagSub::New | TagSub::Ret))
                {
                    if STATE_FUNCS.contains(&fun) && !data.offline {
                        self.add_state(&data, ts);
                    } else {
                        let minions = mentioned_minions(&data);
                        if data.offline {
                            self.offline_minions(&minions, ts);
                        } else {
                            let status = if data.tag_sub == Some(TagSub::New) {
                                JobStatus::New
                            } else if data.success == Some(true) {
                                JobStatus::Succeeded
                            } else {
                                JobStatus::Failed
                            };
                            self.minions
                                .update(&minions, ts, status, data.jid.as_ref(), None);
                        }
                    }
                }
            }
            None => {
                self.inc(MetricId::SaltEventsTagsFuncs, &[&data.tag_mask, "-"]);
            }
        }

        if data.tag_main == Some(TagMain::Batch)
            && matches!(data.tag_sub, Some(TagSub::Start | TagSub::Done))
            && !data.down_minions.is_empty()
        {
            self.offline_minions(&data.down_minions, ts);
        }

        if !data.trimmed.is_empty() {
            warn!(
                "The event {} with jid: {:?} contains trimmed data: {}",
                data.tag,
                data.jid,
                data.trimmed.join(", ")
            );
            self.inc_plain(MetricId::SaltEventsTrimmedCount);
            self.inc_by_plain(
                MetricId::SaltEventsTrimmedTotal,
                MetricValue::Int(data.trimmed.len() as i64),
            );
        }
    }

    /// Handle a state apply event: classify, count per-result outcomes and
    /// propagate job status to the stores.
    fn add_state(&self, data: &EventRecord, ts: f64) {
        let minions = mentioned_minions(data);
        if minions.is_empty() {
            warn!(
                "Neither 'minions' nor 'id' is specified in event '{}' with jid: {:?}",
                data.tag, data.jid
            );
        }

        if data.tag_sub == Some(TagSub::New) {
            self.store_per_minion_state_data(data, &minions, JobStatus::New, ts);
            return;
        }

        self.inc_plain(MetricId::SaltStateApplies);

        let status;
        if data.errors.is_some_and(|e| e > 0) {
            self.inc(MetricId::SaltStateAppliesStatus, &["errors"]);
            status = JobStatus::Failed;
        } else if data.test {
            self.inc(MetricId::SaltStateAppliesStatus, &["test"]);
            for result in &data.results {
                self.count_result(result.sls.as_deref(), &result.sid, &result.fun, "notrun", result.duration);
            }
            status = JobStatus::Succeeded;
        } else {
            for (count, label) in [
                (data.succeeded, "succeeded"),
                (data.failed, "failed"),
                (data.notrun, "notrun"),
                (data.warnings, "warning"),
            ] {
                if count.is_some_and(|c| c > 0) {
                    self.inc(MetricId::SaltStateAppliesStatus, &[label]);
                }
            }
            for result in &data.results {
                let mut outcome = match result.result {
                    Some(true) => "succeeded".to_string(),
                    Some(false) => "failed".to_string(),
                    None => "notrun".to_string(),
                };
                if result.warning {
                    outcome.push_str("_with_warning");
                }
                self.count_result(
                    result.sls.as_deref(),
                    &result.sid,
                    &result.fun,
                    &outcome,
                    result.duration,
                );
            }
            status = if data.failed.is_some_and(|f| f > 0) {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            };
        }

        self.store_per_minion_state_data(data, &minions, status, ts);
    }

    fn store_per_minion_state_data(
        &self,
        data: &EventRecord,
        minions: &[String],
        status: JobStatus,
        ts: f64,
    ) {
        let Some(key) = &data.state_fun_args else {
            warn!(
                "Ignoring state data for {:?} from jid: {:?}",
                minions, data.jid
            );
            return;
        };
        if data.jid.is_none() {
            debug!("State event without jid on tag {}", data.tag);
        }
        self.minions
            .update(minions, ts, status, data.jid.as_ref(), Some(key));
        self.jobs
            .update(key, minions, status, data.jid.as_ref(), ts);
    }

    /// Mark minions offline and time out their pending jobs.
    fn offline_minions(&self, minions: &[String], ts: f64) {
        for pending in self.minions.offline(minions, ts) {
            self.jobs
                .timeout_minion(&pending.key, &pending.jid, &pending.minion, ts);
        }
    }

    /// Resolve `(sls, sid)` through the cardinality mergers and count one
    /// state result with its duration.
    fn count_result(&self, sls: Option<&str>, sid: &str, fun: &str, status: &str, duration: f64) {
        let labels = self.sls_id_fun_status(sls, sid, fun, status);
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.inc(MetricId::SaltStateResults, &labels);
        if let Err(e) = self.metrics.inc_by(
            MetricId::SaltStateDuration,
            Some(&labels),
            MetricValue::Float(duration),
        ) {
            error!("metrics: {}", e);
        }
    }

    /// Register `(sls, sid, fun, status)` in the label space, applying any
    /// rewrites the cardinality mergers produce, and return the final
    /// label values.
    fn sls_id_fun_status(
        &self,
        sls: Option<&str>,
        sid: &str,
        fun: &str,
        status: &str,
    ) -> [String; 4] {
        let sls = sls.unwrap_or("-");
        let mut space = self.labels.lock().unwrap();

        let mut sls_key = space.merger.resolve(sls);
        if !space.levels.contains_key(&sls_key) {
            space
                .levels
                .insert(sls_key.clone(), SidLevel::new(self.opts.sid_start_merging_on));
            let outcome = space.merger.observe(&sls_key);
            log_new_rules("sls", &outcome);
            self.apply_sls_rewrites(&mut space, outcome);
            sls_key = space.merger.resolve(&sls_key);
        }

        let level = space
            .levels
            .entry(sls_key.clone())
            .or_insert_with(|| SidLevel::new(self.opts.sid_start_merging_on));
        let mut sid_key = level.merger.resolve(sid);
        if !level.entries.contains_key(&sid_key) {
            level.entries.insert(sid_key.clone(), HashMap::new());
            let outcome = level.merger.observe(&sid_key);
            log_new_rules("sid", &outcome);
            Self::apply_sid_rewrites(&self.metrics, level, &sls_key, outcome);
            sid_key = level.merger.resolve(&sid_key);
        }

        level
            .entries
            .entry(sid_key.clone())
            .or_default()
            .entry(fun.to_string())
            .or_default()
            .insert(status.to_string());

        [sls_key, sid_key, fun.to_string(), status.to_string()]
    }

    /// Migrate whole sls keys: every nested sid entry moves with its
    /// metrics, and the destination sid level may merge further in turn.
    fn apply_sls_rewrites(&self, space: &mut LabelSpace, outcome: MergeOutcome) {
        for rw in outcome.rewrites {
            let Some(src_level) = space.levels.remove(&rw.src) else {
                continue;
            };
            let dst_level = space
                .levels
                .entry(rw.dst.clone())
                .or_insert_with(|| SidLevel::new(self.opts.sid_start_merging_on));
            for (sid, funs) in src_level.entries {
                let dst_entry = dst_level.entries.entry(sid.clone()).or_default();
                for (fun, statuses) in funs {
                    let dst_statuses = dst_entry.entry(fun.clone()).or_default();
                    for status in statuses {
                        self.metrics.move_labels(
                            MIGRATED_METRICS,
                            &[&rw.src, &sid, &fun, &status],
                            &[&rw.dst, &sid, &fun, &status],
                        );
                        dst_statuses.insert(status);
                    }
                }
                let nested = dst_level.merger.observe(&sid);
                log_new_rules("sid", &nested);
                Self::apply_sid_rewrites(&self.metrics, dst_level, &rw.dst, nested);
            }
        }
    }

    /// Migrate sid keys within one sls level.
    fn apply_sid_rewrites(
        metrics: &MetricsCollection,
        level: &mut SidLevel,
        sls: &str,
        outcome: MergeOutcome,
    ) {
        for rw in outcome.rewrites {
            let Some(src_funs) = level.entries.remove(&rw.src) else {
                continue;
            };
            let dst_entry = level.entries.entry(rw.dst.clone()).or_default();
            for (fun, statuses) in src_funs {
                let dst_statuses = dst_entry.entry(fun.clone()).or_default();
                for status in statuses {
                    metrics.move_labels(
                        MIGRATED_METRICS,
                        &[sls, &rw.src, &fun, &status],
                        &[sls, &rw.dst, &fun, &status],
                    );
                    dst_statuses.insert(status);
                }
            }
        }
    }

    /// Recompute the minion and state job gauges. Runs on the maintenance
    /// cadence.
    pub fn jobs_metrics_update(&self) {
        self.jobs_metrics_update_at(now_ts());
    }

    pub fn jobs_metrics_update_at(&self, ts: f64) {
        for (key, value) in self.minions.stats(ts) {
            self.set(MetricId::SaltMinions, &[key], MetricValue::Int(value));
        }

        for (key, stats) in self.jobs.stats() {
            let mut mods = key.mods.join(", ");
            if mods.is_empty() && !self.opts.highstate_mods.is_empty() {
                mods = self.opts.highstate_mods.clone();
            }
            let test = if key.test { "true" } else { "false" };
            for (stat, value) in stats {
                self.set(
                    MetricId::SaltStateJobs,
                    &[&key.fun, &mods, test, stat],
                    MetricValue::Int(value),
                );
            }
        }
    }

    /// Time out pending jobs older than `timeout` seconds.
    pub fn complete_with_timeout(&self, timeout: f64, ts: f64) {
        self.jobs.complete_with_timeout(timeout, ts);
    }

    /// Prune completed jids past their retention and forget them in the
    /// minion store.
    pub fn cleanup_job_jids(&self) {
        self.cleanup_job_jids_at(now_ts());
    }

    pub fn cleanup_job_jids_at(&self, ts: f64) {
        for (jid, minions) in self.jobs.cleanup_jids(self.opts.job_cleanup_after, ts) {
            for minion in minions {
                self.minions.cleanup_jid(&minion, &jid);
            }
        }
    }

    fn inc_plain(&self, id: MetricId) {
        if let Err(e) = self.metrics.inc(id, None) {
            error!("metrics: {}", e);
        }
    }

    fn inc_by_plain(&self, id: MetricId, by: MetricValue) {
        if let Err(e) = self.metrics.inc_by(id, None, by) {
            error!("metrics: {}", e);
        }
    }

    fn inc(&self, id: MetricId, labels: &[&str]) {
        if let Err(e) = self.metrics.inc(id, Some(labels)) {
            error!("metrics: {}", e);
        }
    }

    fn set(&self, id: MetricId, labels: &[&str], value: MetricValue) {
        if let Err(e) = self.metrics.set(id, Some(labels), value) {
            error!("metrics: {}", e);
        }
    }
}

/// The minions an event speaks about: the target list, or the single actor.
fn mentioned_minions(data: &EventRecord) -> Vec<String> {
    if !data.minions.is_empty() {
        data.minions.clone()
    } else if let Some(id) = &data.id {
        vec![id.clone()]
    } else {
        Vec::new()
    }
}

fn log_new_rules(dimension: &str, outcome: &MergeOutcome) {
    for (pattern, replacement) in &outcome.new_rules {
        info!(
            "New merging rule for '{}' was automatically applied: {} -> {}",
            dimension, pattern, replacement
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_events::EventParser;
    use serde_json::json;

    fn merger() -> DataMerger {
        DataMerger::new(MergerOptions::default())
    }

    fn parse(tag: &str, data: serde_json::Value) -> EventRecord {
        EventParser::new(&[], &[])
            .unwrap()
            .parse(tag, &data)
            .expect("event should parse")
    }

    /// Value of a metric line matching all given needles.
    fn sample(buf: &str, name: &str, needles: &[&str]) -> Option<f64> {
        buf.lines()
            .filter(|l| l.starts_with(name) && needles.iter().all(|n| l.contains(n)))
            .filter_map(|l| l.rsplit_once(' ').and_then(|(_, v)| v.parse().ok()))
            .next()
    }

    fn new_event() -> EventRecord {
        parse(
            "salt/job/20240101000000000001/new",
            json!({
                "fun": "state.apply",
                "arg": ["web"],
                "minions": ["m1", "m2"],
                "jid": "20240101000000000001",
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        )
    }

    fn ret_event() -> EventRecord {
        parse(
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
        )
    }

    #[test]
    fn new_event_counts_and_creates_pending_job() {
        let m = merger();
        m.add(new_event());

        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_events_total", &[]), Some(1.0));
        assert_eq!(
            sample(&buf, "salt_events_tags{", &["tag=\"salt/job/*/new\""]),
            Some(1.0)
        );
        // No results yet.
        assert_eq!(sample(&buf, "salt_state_applies ", &[]), Some(0.0));

        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(
                &buf,
                "salt_state_jobs{",
                &["fun=\"state.apply\"", "mods=\"web\"", "status=\"pending\""]
            ),
            Some(2.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"targeted\""]),
            Some(2.0)
        );
    }

    #[test]
    fn ret_event_counts_results_and_duration() {
        let m = merger();
        m.add(new_event());
        m.add(ret_event());

        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_state_applies ", &[]), Some(1.0));
        assert_eq!(
            sample(&buf, "salt_state_applies_status{", &["status=\"succeeded\""]),
            Some(1.0)
        );
        assert_eq!(
            sample(
                &buf,
                "salt_state_results{",
                &[
                    "sls=\"web.server\"",
                    "sid=\"nginx\"",
                    "fun=\"pkg.installed\"",
                    "status=\"succeeded\""
                ]
            ),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_duration{", &["sls=\"web.server\""]),
            Some(12.5)
        );

        m.jobs_metrics_update_at(1704067210.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"pending\""]),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"succeeded\""]),
            Some(1.0)
        );
    }

    #[test]
    fn maintenance_times_out_silent_minion() {
        let m = merger();
        m.add(new_event());
        m.add(ret_event());

        // m2 stays silent past the timeout window.
        m.complete_with_timeout(1200.0, 1704067200.0 + 1201.0);
        m.jobs_metrics_update_at(1704067200.0 + 1202.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"ever_timedout\""]),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"pending_jids\""]),
            Some(0.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"completed_jids\""]),
            Some(1.0)
        );
    }

    #[test]
    fn batch_done_marks_down_minions_offline_and_times_out_jobs() {
        let m = merger();
        m.add(new_event());

        let batch = parse(
            "salt/batch/20240101000000000002/done",
            json!({
                "down_minions": ["m2"],
                "_stamp": "2024-01-01T00:01:00.000000"
            }),
        );
        m.add(batch);

        m.jobs_metrics_update_at(1704067265.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"ever_timedout\""]),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_minions{", &["status=\"offline\""]),
            Some(1.0)
        );
    }

    #[test]
    fn offline_ret_does_not_count_as_failure() {
        let m = merger();
        let rec = parse(
            "salt/job/1/ret/m1",
            json!({
                "fun": "state.apply",
                "id": "m1",
                "retcode": 255,
                "stderr": "ssh: unreachable",
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        assert!(rec.offline);
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_state_applies ", &[]), Some(0.0));
        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_minions{", &["status=\"offline\""]),
            Some(1.0)
        );
    }

    #[test]
    fn test_mode_apply_counts_notrun() {
        let m = merger();
        let rec = parse(
            "salt/job/1/ret/m1",
            json!({
                "fun": "state.apply",
                "fun_args": ["web", {"test": true, "__kwarg__": true}],
                "id": "m1",
                "jid": 1,
                "return": {
                    "pkg_|-nginx_|-nginx_|-installed": {
                        "result": true,
                        "duration": 3.0,
                        "__sls__": "web"
                    }
                },
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_applies_status{", &["status=\"test\""]),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_results{", &["status=\"notrun\""]),
            Some(1.0)
        );
        // Test mode classifies the job as succeeded.
        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(
                &buf,
                "salt_state_jobs{",
                &["test=\"true\"", "status=\"succeeded\""]
            ),
            Some(1.0)
        );
    }

    #[test]
    fn error_return_counts_errors_status() {
        let m = merger();
        let rec = parse(
            "salt/job/1/ret/m1",
            json!({
                "fun": "state.apply",
                "fun_args": ["broken"],
                "id": "m1",
                "jid": 1,
                "return": ["No matching sls found for 'broken'"],
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_applies_status{", &["status=\"errors\""]),
            Some(1.0)
        );
        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["status=\"ever_failed\""]),
            Some(1.0)
        );
    }

    #[test]
    fn warning_results_get_suffix() {
        let m = merger();
        let rec = parse(
            "salt/job/1/ret/m1",
            json!({
                "fun": "state.apply",
                "fun_args": ["web"],
                "id": "m1",
                "jid": 1,
                "return": {
                    "pkg_|-nginx_|-nginx_|-installed": {
                        "result": true,
                        "warnings": ["deprecated"],
                        "__sls__": "web"
                    }
                },
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(
            sample(
                &buf,
                "salt_state_results{",
                &["status=\"succeeded_with_warning\""]
            ),
            Some(1.0)
        );
        assert_eq!(
            sample(&buf, "salt_state_applies_status{", &["status=\"warning\""]),
            Some(1.0)
        );
    }

    #[test]
    fn rix_tracked_per_reader() {
        let m = merger();
        let mut rec = new_event();
        rec.rix = Some(2);
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "brine_internal_rix_total{", &["rix=\"2\""]),
            Some(1.0)
        );
    }

    #[test]
    fn trimmed_values_counted() {
        let m = merger();
        let rec = parse(
            "salt/job/1/ret/m1",
            json!({
                "fun": "test.ping",
                "id": "m1",
                "return": {"a": "VALUE_TRIMMED", "b": "VALUE_TRIMMED"},
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_events_trimmed_count", &[]), Some(1.0));
        assert_eq!(sample(&buf, "salt_events_trimmed_total", &[]), Some(2.0));
    }

    #[test]
    fn missing_fun_counted_with_dash() {
        let m = merger();
        let rec = parse("salt/auth", json!({"id": "m1", "_stamp": "2024-01-01T00:00:00.0"}));
        m.add(rec);
        let buf = m.get_metrics();
        assert_eq!(
            sample(
                &buf,
                "salt_events_tags_funcs{",
                &["tag=\"salt/auth\"", "fun=\"-\""]
            ),
            Some(1.0)
        );
    }

    #[test]
    fn auth_event_counts_as_seen() {
        let m = merger();
        m.add(parse(
            "salt/auth",
            json!({"id": "m1", "_stamp": "2024-01-01T00:00:00.000000"}),
        ));
        m.jobs_metrics_update_at(1704067230.0);
        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_minions{", &["status=\"seen\""]), Some(1.0));
        assert_eq!(
            sample(&buf, "salt_minions{", &["status=\"active_1m\""]),
            Some(1.0)
        );
    }

    #[test]
    fn highstate_mods_placeholder_used() {
        let m = DataMerger::new(MergerOptions {
            highstate_mods: "highstate".to_string(),
            ..MergerOptions::default()
        });
        let rec = parse(
            "salt/job/1/new",
            json!({
                "fun": "state.highstate",
                "arg": [],
                "minions": ["m1"],
                "jid": 1,
                "_stamp": "2024-01-01T00:00:00.000000"
            }),
        );
        m.add(rec);
        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        assert_eq!(
            sample(&buf, "salt_state_jobs{", &["mods=\"highstate\"", "status=\"pending\""]),
            Some(1.0)
        );
    }

    #[test]
    fn cleanup_forgets_old_jids() {
        let m = merger();
        m.add(new_event());
        m.add(ret_event());
        let ts0 = 1704067200.0;
        m.complete_with_timeout(1200.0, ts0 + 1300.0);
        // Not old enough yet.
        m.cleanup_job_jids_at(ts0 + 1400.0);
        m.jobs_metrics_update_at(ts0 + 1401.0);
        assert_eq!(
            sample(&m.get_metrics(), "salt_state_jobs{", &["status=\"completed_jids\""]),
            Some(1.0)
        );
        // Past the retention window.
        m.cleanup_job_jids_at(ts0 + 1300.0 + 1201.0);
        m.jobs_metrics_update_at(ts0 + 1300.0 + 1202.0);
        assert_eq!(
            sample(&m.get_metrics(), "salt_state_jobs{", &["status=\"completed_jids\""]),
            Some(0.0)
        );
    }

    #[test]
    fn sls_cardinality_collapses_past_threshold() {
        let m = DataMerger::new(MergerOptions {
            sls_start_merging_on: 70,
            ..MergerOptions::default()
        });
        let parser = EventParser::new(&[], &[]).unwrap();
        for i in 0..71 {
            let data = json!({
                "fun": "state.apply",
                "fun_args": ["env/prod"],
                "id": format!("m{}", i),
                "jid": i + 1,
                "return": {
                    "pkg_|-nginx_|-nginx_|-installed": {
                        "result": true,
                        "duration": 1.0,
                        "__sls__": format!("env/prod/srv{:02}", i)
                    }
                },
                "_stamp": "2024-01-01T00:00:00.000000"
            });
            let rec = parser
                .parse(&format!("salt/job/{}/ret/m{}", i + 1, i), &data)
                .unwrap();
            m.add(rec);
        }

        let buf = m.get_metrics();
        let rows: Vec<&str> = buf
            .lines()
            .filter(|l| l.starts_with("salt_state_results{"))
            .collect();
        let total: f64 = rows
            .iter()
            .filter_map(|l| l.rsplit_once(' ').and_then(|(_, v)| v.parse::<f64>().ok()))
            .sum();
        // The 71 distinct sls values collapsed into a bounded set of
        // representatives; no counts were lost on the way.
        assert!(rows.len() < 71, "rows: {}", rows.len());
        assert_eq!(total, 71.0);
        assert!(buf.contains("env.prod."));
    }

    #[test]
    fn duplicate_ret_logged_not_double_completed() {
        let m = merger();
        m.add(new_event());
        m.add(ret_event());
        m.add(ret_event());
        // The duplicate return is tracked on the minion, and the job stats
        // stay consistent.
        assert_eq!(
            m.minions().completed_returns(
                "m1",
                &brine_events::Jid::Num(20240101000000000001u128)
            ),
            Some(2)
        );
        let buf = m.get_metrics();
        assert_eq!(sample(&buf, "salt_state_applies ", &[]), Some(2.0));
    }

    #[test]
    fn minion_buckets_present() {
        let m = merger();
        m.add(new_event());
        m.jobs_metrics_update_at(1704067201.0);
        let buf = m.get_metrics();
        for bucket in crate::minion::MINION_STAT_KEYS {
            assert!(
                buf.contains(&format!("salt_minions{{status=\"{}\"}}", bucket)),
                "missing bucket {}",
                bucket
            );
        }
    }
}
