//! Canonical event records produced by the parser and consumed by the
//! merger.

use std::fmt;

use crate::tags::{TagMain, TagSub};

/// Job identifier. Salt JIDs are 20-digit decimal timestamps and do not fit
/// in `u64`; identifiers that are not numeric at all are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Jid {
    Num(u128),
    Str(String),
}

impl Jid {
    pub fn parse(s: &str) -> Jid {
        match s.parse::<u128>() {
            Ok(n) => Jid::Num(n),
            Err(_) => Jid::Str(s.to_string()),
        }
    }

    /// Read a jid from a payload field, which may be a JSON number or
    /// string.
    pub fn from_value(value: &serde_json::Value) -> Option<Jid> {
        match value {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(u) => Some(Jid::Num(u128::from(u))),
                None => Some(Jid::Str(n.to_string())),
            },
            serde_json::Value::String(s) => Some(Jid::parse(s)),
            _ => None,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jid::Num(n) => write!(f, "{}", n),
            Jid::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Identity of a state invocation: function, normalized mods and the
/// test-mode kwarg. This is the aggregation key for state jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateFunArgs {
    pub fun: String,
    pub mods: Vec<String>,
    pub test: bool,
}

/// One normalized entry of a state return mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateResult {
    /// Normalized state source (slashes replaced by dots, rename rules
    /// applied); absent when the return carried no `__sls__`.
    pub sls: Option<String>,
    /// Pre-normalization `__sls__`, kept when it differs.
    pub sls_orig: Option<String>,
    pub sid: String,
    pub sid_orig: Option<String>,
    /// `module.function` recovered from the return key.
    pub fun: String,
    pub name: Option<String>,
    /// `Some(true)` succeeded, `Some(false)` failed, `None` not run.
    pub result: Option<bool>,
    /// The entry carried warnings.
    pub warning: bool,
    pub duration: f64,
    pub changed: bool,
}

/// Canonical event record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventRecord {
    pub tag: String,
    pub tag_mask: String,
    pub tag_main: Option<TagMain>,
    pub tag_sub: Option<TagSub>,
    /// Event timestamp, epoch seconds.
    pub ts: f64,
    pub jid: Option<Jid>,
    /// Minion id — from the payload, or recovered from the tag.
    pub id: Option<String>,
    pub user: Option<String>,
    pub fun: Option<String>,
    /// Minions targeted by the event.
    pub minions: Vec<String>,
    pub success: Option<bool>,
    /// An ssh minion reported unreachable (retcode 255 with stderr).
    pub offline: bool,
    /// Test-mode apply (`test=True` kwarg or `state.test`).
    pub test: bool,
    pub state_fun_args: Option<StateFunArgs>,
    /// Minions reported down by a batch event.
    pub down_minions: Vec<String>,
    /// Paths of values trimmed by the master before publishing.
    pub trimmed: Vec<String>,
    /// Error count when the state return was an error list.
    pub errors: Option<u64>,
    pub changes: Option<u64>,
    /// Total duration over all results, seconds of wall time as reported.
    pub duration: Option<f64>,
    pub succeeded: Option<u64>,
    pub failed: Option<u64>,
    pub notrun: Option<u64>,
    pub warnings: Option<u64>,
    pub results: Vec<StateResult>,
    /// Index of the reader that parsed this record.
    pub rix: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jid_numeric_exceeding_u64() {
        // 20-digit Salt JID
        let jid = Jid::parse("20240101000000000001");
        assert_eq!(jid, Jid::Num(20240101000000000001u128));
        assert_eq!(jid.to_string(), "20240101000000000001");
    }

    #[test]
    fn jid_non_numeric_kept_verbatim() {
        let jid = Jid::parse("req-abc");
        assert_eq!(jid, Jid::Str("req-abc".to_string()));
    }

    #[test]
    fn jid_from_json_number_and_string() {
        assert_eq!(
            Jid::from_value(&json!(1234)),
            Some(Jid::Num(1234))
        );
        assert_eq!(
            Jid::from_value(&json!("20240101000000000001")),
            Some(Jid::Num(20240101000000000001u128))
        );
        assert_eq!(Jid::from_value(&json!(["x"])), None);
    }

    #[test]
    fn state_fun_args_usable_as_key() {
        use std::collections::HashMap;
        let key = StateFunArgs {
            fun: "state.apply".to_string(),
            mods: vec!["web".to_string()],
            test: false,
        };
        let mut map = HashMap::new();
        map.insert(key.clone(), 1);
        assert_eq!(map.get(&key), Some(&1));
    }
}
