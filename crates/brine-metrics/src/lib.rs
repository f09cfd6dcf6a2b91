//! Brine Metrics - fixed-registry metrics store
//!
//! A small metrics store tailored to the aggregation pipeline: every metric
//! is declared in one static table, values can be moved between label sets
//! when labels are rewritten at runtime, and a monotonically increasing
//! epoch lets the publisher skip serialization when nothing changed.
//!
//! Serialization is the Prometheus text exposition format: `# HELP` /
//! `# TYPE` headers followed by one sample line per label combination.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Metric identifiers. The declaration order here is the serialization
/// order of the output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricId {
    SaltEventsTotal = 0,
    SaltEventsTags,
    SaltEventsTagsFuncs,
    SaltEventsTrimmedCount,
    SaltEventsTrimmedTotal,
    SaltStateApplies,
    SaltStateAppliesStatus,
    SaltStateResults,
    SaltStateDuration,
    SaltStateJobs,
    SaltMinions,
    InternalRixTotal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Static definition of one metric.
pub struct MetricDef {
    pub id: MetricId,
    pub kind: MetricKind,
    pub name: &'static str,
    pub help: &'static str,
    /// Ordered label schema; `None` for unlabeled scalars.
    pub labels: Option<&'static [&'static str]>,
}

const LABELS_STATUS: &[&str] = &["status"];
const LABELS_SLS_SID_FUN_STATUS: &[&str] = &["sls", "sid", "fun", "status"];
const LABELS_FUN_MODS_TEST_STATUS: &[&str] = &["fun", "mods", "test", "status"];

/// The metric table. Indexed by `MetricId as usize`.
pub const METRICS: &[MetricDef] = &[
    MetricDef {
        id: MetricId::SaltEventsTotal,
        kind: MetricKind::Counter,
        name: "salt_events_total",
        help: "Total number of events processed",
        labels: None,
    },
    MetricDef {
        id: MetricId::SaltEventsTags,
        kind: MetricKind::Counter,
        name: "salt_events_tags",
        help: "Total number of events processed by tag masks",
        labels: Some(&["tag"]),
    },
    MetricDef {
        id: MetricId::SaltEventsTagsFuncs,
        kind: MetricKind::Counter,
        name: "salt_events_tags_funcs",
        help: "Total number of events processed by tag masks and functions",
        labels: Some(&["tag", "fun"]),
    },
    MetricDef {
        id: MetricId::SaltEventsTrimmedCount,
        kind: MetricKind::Counter,
        name: "salt_events_trimmed_count",
        help: "Total number of trimmed events",
        labels: None,
    },
    MetricDef {
        id: MetricId::SaltEventsTrimmedTotal,
        kind: MetricKind::Counter,
        name: "salt_events_trimmed_total",
        help: "Total number of trimmed values in the events",
        labels: None,
    },
    MetricDef {
        id: MetricId::SaltStateApplies,
        kind: MetricKind::Counter,
        name: "salt_state_applies",
        help: "Total number of state apply events",
        labels: None,
    },
    MetricDef {
        id: MetricId::SaltStateAppliesStatus,
        kind: MetricKind::Counter,
        name: "salt_state_applies_status",
        help: "Total number of state apply events by status",
        labels: Some(LABELS_STATUS),
    },
    MetricDef {
        id: MetricId::SaltStateResults,
        kind: MetricKind::Counter,
        name: "salt_state_results",
        help: "Total number of state apply results",
        labels: Some(LABELS_SLS_SID_FUN_STATUS),
    },
    MetricDef {
        id: MetricId::SaltStateDuration,
        kind: MetricKind::Counter,
        name: "salt_state_duration",
        help: "Total time of state apply duration",
        labels: Some(LABELS_SLS_SID_FUN_STATUS),
    },
    MetricDef {
        id: MetricId::SaltStateJobs,
        kind: MetricKind::Gauge,
        name: "salt_state_jobs",
        help: "The statuses of salt state jobs",
        labels: Some(LABELS_FUN_MODS_TEST_STATUS),
    },
    MetricDef {
        id: MetricId::SaltMinions,
        kind: MetricKind::Gauge,
        name: "salt_minions",
        help: "Total number of the salt minions by statuses",
        labels: Some(LABELS_STATUS),
    },
    MetricDef {
        id: MetricId::InternalRixTotal,
        kind: MetricKind::Counter,
        name: "brine_internal_rix_total",
        help: "Total number of events processed by specific reader",
        labels: Some(&["rix"]),
    },
];

/// A metric value. Integer and float samples format differently: floats
/// carry exactly three fractional digits, integers none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }

    /// Add another value; mixing an integer with a float promotes to float.
    fn add(self, other: MetricValue) -> MetricValue {
        match (self, other) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a + b),
            (a, b) => MetricValue::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metric {0} does not take labels")]
    UnexpectedLabels(&'static str),
    #[error("metric {0} requires labels")]
    MissingLabels(&'static str),
    #[error("metric {metric} expects {expected} label values, got {got}")]
    LabelMismatch {
        metric: &'static str,
        expected: usize,
        got: usize,
    },
}

enum EntryData {
    Scalar(MetricValue),
    /// Label values → sample. BTreeMap keeps serialization deterministic
    /// for a given epoch.
    Labeled(BTreeMap<Vec<String>, MetricValue>),
}

struct Entry {
    def: &'static MetricDef,
    data: Mutex<EntryData>,
}

/// The metrics store: one entry per table row, per-entry locks, atomic
/// epoch.
pub struct MetricsCollection {
    entries: Vec<Entry>,
    epoch: AtomicU64,
}

impl Default for MetricsCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollection {
    pub fn new() -> Self {
        let entries = METRICS
            .iter()
            .map(|def| Entry {
                def,
                data: Mutex::new(match def.labels {
                    None => EntryData::Scalar(MetricValue::Int(0)),
                    Some(_) => EntryData::Labeled(BTreeMap::new()),
                }),
            })
            .collect();
        Self {
            entries,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn get_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Increment by one.
    pub fn inc(&self, id: MetricId, labels: Option<&[&str]>) -> Result<(), MetricsError> {
        self.inc_by(id, labels, MetricValue::Int(1))
    }

    /// Increment by an arbitrary amount. Always bumps the epoch.
    pub fn inc_by(
        &self,
        id: MetricId,
        labels: Option<&[&str]>,
        by: MetricValue,
    ) -> Result<(), MetricsError> {
        let entry = &self.entries[id as usize];
        let mut data = entry.data.lock().unwrap();
        match (&mut *data, labels) {
            (EntryData::Scalar(value), None) => {
                *value = value.add(by);
            }
            (EntryData::Labeled(map), Some(values)) => {
                check_arity(entry.def, values)?;
                let slot = map
                    .entry(values.iter().map(|s| s.to_string()).collect())
                    .or_insert(MetricValue::Int(0));
                *slot = slot.add(by);
            }
            (EntryData::Scalar(_), Some(_)) => {
                return Err(MetricsError::UnexpectedLabels(entry.def.name))
            }
            (EntryData::Labeled(_), None) => {
                return Err(MetricsError::MissingLabels(entry.def.name))
            }
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Set to a value. Bumps the epoch only when the stored value actually
    /// changes. Setting a counter is permitted (the label migration path
    /// relies on it) and monotonicity is not enforced.
    pub fn set(
        &self,
        id: MetricId,
        labels: Option<&[&str]>,
        value: MetricValue,
    ) -> Result<(), MetricsError> {
        let entry = &self.entries[id as usize];
        let mut data = entry.data.lock().unwrap();
        let changed = match (&mut *data, labels) {
            (EntryData::Scalar(slot), None) => {
                let changed = *slot != value;
                *slot = value;
                changed
            }
            (EntryData::Labeled(map), Some(values)) => {
                check_arity(entry.def, values)?;
                let key: Vec<String> = values.iter().map(|s| s.to_string()).collect();
                match map.insert(key, value) {
                    Some(old) => old != value,
                    None => true,
                }
            }
            (EntryData::Scalar(_), Some(_)) => {
                return Err(MetricsError::UnexpectedLabels(entry.def.name))
            }
            (EntryData::Labeled(_), None) => {
                return Err(MetricsError::MissingLabels(entry.def.name))
            }
        };
        if changed {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Move the value at `src` into `dst` (adding when `dst` exists) for
    /// each of the given metrics, removing the source cell. Metrics without
    /// a cell at `src` are skipped. The epoch is left alone; the
    /// publisher's forced republish covers pure migrations.
    pub fn move_labels(&self, ids: &[MetricId], src: &[&str], dst: &[&str]) {
        for &id in ids {
            let entry = &self.entries[id as usize];
            let mut data = entry.data.lock().unwrap();
            if let EntryData::Labeled(map) = &mut *data {
                let src_key: Vec<String> = src.iter().map(|s| s.to_string()).collect();
                let Some(value) = map.remove(&src_key) else {
                    continue;
                };
                let slot = map
                    .entry(dst.iter().map(|s| s.to_string()).collect())
                    .or_insert(MetricValue::Int(0));
                *slot = slot.add(value);
            }
        }
    }

    /// Serialize the whole store in table order.
    pub fn get_buf(&self) -> String {
        let mut buf = String::new();
        for entry in &self.entries {
            let def = entry.def;
            let _ = writeln!(buf, "# HELP {} {}", def.name, def.help);
            let _ = writeln!(buf, "# TYPE {} {}", def.name, def.kind.as_str());
            let data = entry.data.lock().unwrap();
            match &*data {
                EntryData::Scalar(value) => {
                    let _ = writeln!(buf, "{} {}", def.name, value);
                }
                EntryData::Labeled(map) => {
                    let names = def.labels.unwrap_or_default();
                    for (values, sample) in map.iter() {
                        let _ = write!(buf, "{}{{", def.name);
                        for (i, (name, value)) in names.iter().zip(values).enumerate() {
                            if i > 0 {
                                buf.push(',');
                            }
                            let _ =
                                write!(buf, "{}=\"{}\"", name, value.replace('"', "\\\""));
                        }
                        let _ = writeln!(buf, "}} {}", sample);
                    }
                }
            }
        }
        buf
    }
}

fn check_arity(def: &'static MetricDef, values: &[&str]) -> Result<(), MetricsError> {
    let expected = def.labels.map_or(0, |labels| labels.len());
    if values.len() != expected {
        return Err(MetricsError::LabelMismatch {
            metric: def.name,
            expected,
            got: values.len(),
        });
    }
    Ok(())
}
