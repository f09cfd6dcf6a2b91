//! Brine Events - Salt event normalization
//!
//! This crate turns raw `{tag, data}` events from the master event bus into
//! canonical [`EventRecord`]s:
//! - tag masking and categorization (`tags`)
//! - the record model shared by the pipeline (`record`)
//! - the event parser with rename rules and state-return handling (`parser`)

pub mod parser;
pub mod record;
pub mod tags;

pub use parser::EventParser;
pub use record::{EventRecord, Jid, StateFunArgs, StateResult};
pub use tags::{match_tag, TagMain, TagMatch, TagSub};
