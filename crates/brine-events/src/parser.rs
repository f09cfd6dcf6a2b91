//! Event parser — normalizes one raw `{tag, data}` event into an
//! [`EventRecord`], or drops it.
//!
//! The parser is a pure function of its inputs and its compiled rename
//! rules. Malformed events are absorbed: they are logged at warning or
//! debug level and dropped, never propagated as errors.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::record::{EventRecord, Jid, StateFunArgs, StateResult};
use crate::tags::{match_tag, TagMain, TagSub};

/// Divider used inside state return keys (`module_|-sid_|-name_|-function`).
const STATE_TAG_DIV: &str = "_|-";

/// `(main, sub, fun)` triples dropped outright.
const IGNORE_EVENTS: &[(TagMain, TagSub, &str)] = &[
    (TagMain::Wheel, TagSub::New, "wheel.key.list_all"),
    (TagMain::Wheel, TagSub::Ret, "wheel.key.list_all"),
];

/// Tag categories for which a missing function is expected and not worth a
/// warning.
const NO_FUN_WARNING: &[(TagMain, Option<TagSub>)] = &[
    (TagMain::Auth, None),
    (TagMain::Batch, Some(TagSub::Start)),
    (TagMain::Batch, Some(TagSub::Done)),
    (TagMain::MinionStart, None),
    (TagMain::MinionRefresh, None),
    (TagMain::Stats, None),
];

/// Compile a pattern with Python `re.match` semantics (anchored at the
/// start, not at the end).
pub fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

/// Salt event parser holding the configured label rename rules.
///
/// Each pipeline reader owns its own instance, so the compiled rules are
/// never shared across tasks.
pub struct EventParser {
    sls_rules: Vec<(Regex, String)>,
    sid_rules: Vec<(Regex, String)>,
}

impl EventParser {
    /// Build a parser from `(pattern, replacement)` rename rule lists.
    /// Rules apply first-match-wins in the given order.
    pub fn new(
        sls_rules: &[(String, String)],
        sid_rules: &[(String, String)],
    ) -> Result<Self, regex::Error> {
        let compile = |rules: &[(String, String)]| {
            rules
                .iter()
                .map(|(p, r)| Ok((compile_anchored(p)?, r.clone())))
                .collect::<Result<Vec<_>, regex::Error>>()
        };
        Ok(Self {
            sls_rules: compile(sls_rules)?,
            sid_rules: compile(sid_rules)?,
        })
    }

    /// Parse one event. Returns `None` when the event is ignored or
    /// malformed beyond use.
    pub fn parse(&self, tag: &str, data: &Value) -> Option<EventRecord> {
        let tag_match = match_tag(tag);
        let mut fun = data
            .get("fun")
            .and_then(Value::as_str)
            .map(str::to_string);

        // Key events carry the action in `act` instead of `fun`.
        if tag_match.main == Some(TagMain::Key) && fun.is_none() {
            fun = data.get("act").and_then(Value::as_str).map(str::to_string);
        }

        if fun.is_none() {
            let known = tag_match
                .main
                .is_some_and(|main| NO_FUN_WARNING.contains(&(main, tag_match.sub)));
            if !known {
                warn!(
                    "Ignore the event as there is no function specified in the data: ({}) {}",
                    tag, data
                );
                return None;
            }
        }

        if let (Some(main), Some(sub), Some(fun)) = (tag_match.main, tag_match.sub, fun.as_deref())
        {
            if IGNORE_EVENTS.contains(&(main, sub, fun)) {
                return None;
            }
        }

        let ts = parse_timestamp(data.get("_stamp").and_then(Value::as_str));

        let mut record = EventRecord {
            tag: tag.to_string(),
            tag_mask: tag_match.mask,
            tag_main: tag_match.main,
            tag_sub: tag_match.sub,
            ts,
            fun,
            ..EventRecord::default()
        };

        record.id = data
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(tag_match.minion_id);
        record.user = data.get("user").and_then(Value::as_str).map(str::to_string);
        record.success = data.get("success").and_then(Value::as_bool);
        record.jid = data.get("jid").and_then(Jid::from_value);

        match data.get("minions") {
            Some(Value::Array(items)) => {
                record.minions = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
            Some(other) => {
                warn!("Minions list is malformed: ({}): {}", tag, other);
            }
            None => {}
        }

        record.trimmed = trimmed_paths(data);

        let is_job = record.tag_main == Some(TagMain::Job);
        let is_job_new_or_ret =
            is_job && matches!(record.tag_sub, Some(TagSub::New | TagSub::Ret));

        if record.tag_main == Some(TagMain::Batch)
            && matches!(record.tag_sub, Some(TagSub::Start | TagSub::Done))
        {
            if let Some(Value::Array(items)) = data.get("down_minions") {
                record.down_minions = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
        }

        // An ssh minion answering retcode 255 with stderr is unreachable,
        // not failed.
        if is_job_new_or_ret
            && data.get("retcode").and_then(Value::as_i64) == Some(255)
            && data
                .get("stderr")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        {
            record.offline = true;
            debug!(
                "Considering response from '{:?}' ssh minion on jid: {:?} as offline status",
                record.id, record.jid
            );
        }

        let is_state_fun = record
            .fun
            .as_deref()
            .is_some_and(|f| f.starts_with("state."));

        if is_job_new_or_ret && is_state_fun {
            let fun_args = data.get("fun_args").or_else(|| data.get("arg"));
            if let Some(Value::Array(fun_args)) = fun_args {
                let (mods, test_kwarg) = parse_state_fun_args(fun_args);
                let fun = record.fun.clone().unwrap_or_default();
                record.test = test_kwarg || fun == "state.test";
                record.state_fun_args = Some(StateFunArgs {
                    fun,
                    mods,
                    test: test_kwarg,
                });
            }
        }

        if is_job && record.tag_sub == Some(TagSub::Ret) && is_state_fun {
            match data.get("return") {
                Some(Value::Object(ret_map)) => self.parse_state_returns(&mut record, ret_map),
                Some(Value::String(_)) => record.changes = Some(1),
                Some(Value::Array(errs)) => record.errors = Some(errs.len() as u64),
                _ => {}
            }
        }

        Some(record)
    }

    /// Normalize the entries of a state return mapping and roll up their
    /// counters onto the record.
    fn parse_state_returns(&self, record: &mut EventRecord, ret_map: &Map<String, Value>) {
        let mut duration_total = 0.0;
        let mut changes = 0u64;
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let mut notrun = 0u64;
        let mut warnings = 0u64;

        for (rkey, ret) in ret_map {
            let Some(ret) = ret.as_object() else {
                continue;
            };
            let name = ret.get("name").and_then(Value::as_str);
            let Some((split_id, state_fun, split_name)) = split_state_tags(rkey, name) else {
                debug!("Skipping malformed state return key: {}", rkey);
                continue;
            };

            let mut result = StateResult {
                fun: state_fun,
                name: name.map(str::to_string).or(Some(split_name)),
                changed: ret.get("changes").is_some_and(is_truthy),
                warning: ret.contains_key("warnings"),
                ..StateResult::default()
            };

            if result.changed {
                changes += 1;
            }

            if let Some(orig) = ret.get("__sls__").and_then(Value::as_str) {
                let normalized = orig.replace('/', ".");
                let mut renamed = normalized.clone();
                for (p, r) in &self.sls_rules {
                    if p.is_match(&normalized) {
                        renamed = r.clone();
                        break;
                    }
                }
                if renamed != orig {
                    result.sls_orig = Some(orig.to_string());
                }
                result.sls = Some(renamed);
            }

            let sid = ret
                .get("__id__")
                .and_then(Value::as_str)
                .unwrap_or(&split_id);
            result.sid = sid.to_string();
            for (p, r) in &self.sid_rules {
                if p.is_match(sid) {
                    result.sid_orig = Some(sid.to_string());
                    result.sid = r.clone();
                    break;
                }
            }

            let mut outcome = ret.get("result").and_then(Value::as_bool);
            if ret.get("__state_ran__") == Some(&Value::Bool(false)) {
                outcome = None;
            }
            result.result = outcome;
            match outcome {
                Some(true) => succeeded += 1,
                Some(false) => failed += 1,
                None => notrun += 1,
            }
            if result.warning {
                warnings += 1;
            }

            if let Some(dur) = ret.get("duration").and_then(parse_duration) {
                result.duration = dur;
                duration_total += dur;
            }

            record.results.push(result);
        }

        record.duration = Some(duration_total);
        record.changes = Some(changes);
        if succeeded > 0 {
            record.succeeded = Some(succeeded);
        }
        if failed > 0 {
            record.failed = Some(failed);
        }
        if notrun > 0 {
            record.notrun = Some(notrun);
        }
        if warnings > 0 {
            record.warnings = Some(warnings);
        }
    }
}

/// Parse a Salt `_stamp` into epoch seconds; fall back to the current time
/// when missing or unparseable.
fn parse_timestamp(stamp: Option<&str>) -> f64 {
    if let Some(stamp) = stamp {
        if let Ok(dt) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f") {
            return dt.and_utc().timestamp_micros() as f64 / 1_000_000.0;
        }
    }
    now_ts()
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Duration values come as numbers or as `"N ms"` strings.
fn parse_duration(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.strip_suffix(" ms").and_then(|v| v.trim().parse().ok()),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Breadth-first scan for values the master trimmed before publishing.
/// Returns the JSON-ish paths of every `VALUE_TRIMMED` marker.
fn trimmed_paths(data: &Value) -> Vec<String> {
    let mut found = Vec::new();
    let mut queue: VecDeque<(&Value, String)> = VecDeque::new();
    queue.push_back((data, String::new()));
    while let Some((node, path)) = queue.pop_front() {
        match node {
            Value::Object(map) => {
                for (k, v) in map {
                    queue.push_back((v, format!("{}[\"{}\"]", path, k.replace('"', "\\\""))));
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    queue.push_back((v, format!("{}[{}]", path, i)));
                }
            }
            Value::String(s) if s == "VALUE_TRIMMED" => found.push(path),
            _ => {}
        }
    }
    found
}

/// Split a state return key into `(sid, "module.function", name)`.
///
/// The middle section is `sid_|-name`, except that the sid itself may
/// contain the divider; when the payload supplies the name, strip it from
/// the middle section instead of splitting blindly.
fn split_state_tags(key: &str, name: Option<&str>) -> Option<(String, String, String)> {
    let (module, rest) = key.split_once(STATE_TAG_DIV)?;
    let (middle, fun) = rest.rsplit_once(STATE_TAG_DIV)?;

    let mut out_name = name.map(str::to_string);
    let mut sid = None;
    // An empty name must fall through to the split below, like a missing
    // one; stripping a bare divider would garble the sid.
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        let div_name = format!("{}{}", STATE_TAG_DIV, name);
        if middle.contains(&div_name) {
            sid = Some(middle.replace(&div_name, ""));
        }
    }
    let sid = match sid {
        Some(sid) => sid,
        None => {
            let (id, n) = middle.split_once(STATE_TAG_DIV)?;
            out_name = Some(n.to_string());
            id.to_string()
        }
    };

    Some((sid, format!("{}.{}", module, fun), out_name.unwrap_or_default()))
}

/// Parse state function arguments into `(mods, test)`.
///
/// Array elements that are objects contribute kwargs (minus the `__kwarg__`
/// marker); `name=value` strings contribute kwargs with `true`/`false`
/// parsed as booleans; everything else is positional. The `mods` kwarg
/// overrides positionals. Mods not beginning with `/` have `/` replaced by
/// `.`.
fn parse_state_fun_args(fun_args: &[Value]) -> (Vec<String>, bool) {
    let mut args: Vec<String> = Vec::new();
    let mut kwargs: Map<String, Value> = Map::new();

    for arg in fun_args {
        match arg {
            Value::Object(map) => {
                for (k, v) in map {
                    if k == "__kwarg__" {
                        continue;
                    }
                    kwargs.insert(k.clone(), v.clone());
                }
            }
            Value::String(s) => match parse_kwarg(s) {
                Some((k, v)) => {
                    kwargs.insert(k, v);
                }
                None => args.push(s.clone()),
            },
            other => {
                if let Some(s) = scalar_to_string(other) {
                    args.push(s);
                }
            }
        }
    }

    let mods: Vec<String> = match kwargs.remove("mods") {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(other) => scalar_to_string(&other).into_iter().collect(),
        None => args,
    };
    let mods = mods
        .iter()
        .map(|m| {
            if m.starts_with('/') {
                m.clone()
            } else {
                m.replace('/', ".")
            }
        })
        .collect();

    let test = kwargs.get("test") == Some(&Value::Bool(true));
    (mods, test)
}

fn parse_kwarg(s: &str) -> Option<(String, Value)> {
    let (name, value) = s.split_once('=')?;
    let valid_name = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_name {
        return None;
    }
    let value = match value {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        other => Value::String(other.to_string()),
    };
    Some((name.to_string(), value))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
