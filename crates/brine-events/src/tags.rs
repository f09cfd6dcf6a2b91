//! Tag normalization — maps raw event tags onto masked buckets.

use lazy_static::lazy_static;
use regex::Regex;

/// Main event category derived from the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagMain {
    Job,
    Jid,
    MinionRefresh,
    Batch,
    Auth,
    Key,
    MinionStart,
    Beacon,
    Run,
    Wheel,
    Stats,
}

/// Sub-category within a main category (new/ret for jobs, runners and
/// wheels; start/done for batches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagSub {
    New,
    Ret,
    Start,
    Done,
}

/// Result of matching a tag against the pattern table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    /// Normalized tag with numeric and per-minion segments replaced by `*`.
    pub mask: String,
    pub main: Option<TagMain>,
    pub sub: Option<TagSub>,
    /// Minion id captured from the tag, when the pattern carries one.
    pub minion_id: Option<String>,
}

lazy_static! {
    static ref JOB_RET: Regex = Regex::new(r"^salt/job/\d+/ret/(.*)").unwrap();
    static ref BARE_JID: Regex = Regex::new(r"^\d+").unwrap();
    static ref MINION_REFRESH: Regex = Regex::new(r"^minion/refresh/(.+)").unwrap();
    static ref JOB_NEW: Regex = Regex::new(r"^salt/job/\d+/new").unwrap();
    static ref BATCH: Regex = Regex::new(r"^salt/batch/\d+/(start|done)").unwrap();
    static ref MINION_START: Regex = Regex::new(r"^salt/minion/([^/]+)/start").unwrap();
    static ref AUTH: Regex = Regex::new(r"^salt/auth").unwrap();
    static ref KEY: Regex = Regex::new(r"^salt/key").unwrap();
    static ref BEACON: Regex = Regex::new(r"^salt/beacon/[^/]+/(.*)").unwrap();
    static ref RUN_WHEEL: Regex = Regex::new(r"^salt/(run|wheel)/\d+/(new|ret)").unwrap();
    static ref STATS: Regex = Regex::new(r"^salt/stats/[^/]+").unwrap();
}

/// Match a raw tag against the ordered pattern table. The first pattern
/// wins; a tag matching none of them keeps its original value as the mask
/// with no category attached.
pub fn match_tag(tag: &str) -> TagMatch {
    if let Some(caps) = JOB_RET.captures(tag) {
        return TagMatch {
            mask: "salt/job/*/ret/*".to_string(),
            main: Some(TagMain::Job),
            sub: Some(TagSub::Ret),
            minion_id: caps.get(1).map(|m| m.as_str().to_string()),
        };
    }
    if BARE_JID.is_match(tag) {
        return TagMatch {
            mask: "JID".to_string(),
            main: Some(TagMain::Jid),
            sub: None,
            minion_id: None,
        };
    }
    if let Some(caps) = MINION_REFRESH.captures(tag) {
        return TagMatch {
            mask: "minion/refresh/*".to_string(),
            main: Some(TagMain::MinionRefresh),
            sub: None,
            minion_id: caps.get(1).map(|m| m.as_str().to_string()),
        };
    }
    if JOB_NEW.is_match(tag) {
        return TagMatch {
            mask: "salt/job/*/new".to_string(),
            main: Some(TagMain::Job),
            sub: Some(TagSub::New),
            minion_id: None,
        };
    }
    if let Some(caps) = BATCH.captures(tag) {
        let phase = &caps[1];
        return TagMatch {
            mask: format!("salt/batch/*/{}", phase),
            main: Some(TagMain::Batch),
            sub: Some(if phase == "start" {
                TagSub::Start
            } else {
                TagSub::Done
            }),
            minion_id: None,
        };
    }
    if let Some(caps) = MINION_START.captures(tag) {
        return TagMatch {
            mask: "salt/minion/*/start".to_string(),
            main: Some(TagMain::MinionStart),
            sub: None,
            minion_id: caps.get(1).map(|m| m.as_str().to_string()),
        };
    }
    if AUTH.is_match(tag) {
        return TagMatch {
            mask: "salt/auth".to_string(),
            main: Some(TagMain::Auth),
            sub: None,
            minion_id: None,
        };
    }
    if KEY.is_match(tag) {
        return TagMatch {
            mask: "salt/key".to_string(),
            main: Some(TagMain::Key),
            sub: None,
            minion_id: None,
        };
    }
    if let Some(caps) = BEACON.captures(tag) {
        return TagMatch {
            mask: format!("salt/beacon/*/{}", &caps[1]),
            main: Some(TagMain::Beacon),
            sub: None,
            minion_id: None,
        };
    }
    if let Some(caps) = RUN_WHEEL.captures(tag) {
        let main = if &caps[1] == "run" {
            TagMain::Run
        } else {
            TagMain::Wheel
        };
        let sub = if &caps[2] == "new" {
            TagSub::New
        } else {
            TagSub::Ret
        };
        return TagMatch {
            mask: format!("salt/{}/*/{}", &caps[1], &caps[2]),
            main: Some(main),
            sub: Some(sub),
            minion_id: None,
        };
    }
    if STATS.is_match(tag) {
        return TagMatch {
            mask: "salt/stats/*".to_string(),
            main: Some(TagMain::Stats),
            sub: None,
            minion_id: None,
        };
    }
    TagMatch {
        mask: tag.to_string(),
        main: None,
        sub: None,
        minion_id: None,
    }
}
