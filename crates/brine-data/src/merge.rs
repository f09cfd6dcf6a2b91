//! Label-cardinality merger.
//!
//! Watches a population of label values and, once it grows past a
//! threshold, discovers common substrings across the values and emits
//! rewrite rules `(pattern, "frag1*frag2*…")` that collapse many values to
//! a bounded set of representatives. Replacements are terminal: once
//! emitted they are never merged further.
//!
//! Rule discovery works on matching blocks between value pairs (the
//! longest-common-block decomposition a sequence matcher produces),
//! keeping only blocks of at least [`MATCH_LEN_THRESHOLD`] characters and
//! scoring candidates by occurrence, match quality and how many existing
//! values the generated pattern would merge.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use regex::Regex;

/// Default minimum fraction of the longer value a candidate's fragments
/// must cover. The label dimensions run at a stricter bar; see
/// [`SmartMerger::with_match_quality`].
const DEFAULT_MATCH_QUALITY: f64 = 0.3;
/// Minimum matching block length to keep as a fragment.
const MATCH_LEN_THRESHOLD: usize = 3;

/// A key rewrite to apply: every datum stored under `src` moves to `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub src: String,
    pub dst: String,
}

/// Result of observing a key: newly generated rules (for logging) and the
/// key rewrites the caller must apply to its own storage.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// `(pattern, replacement)` pairs generated this round.
    pub new_rules: Vec<(String, String)>,
    pub rewrites: Vec<Rewrite>,
}

/// The rule engine for one label dimension.
pub struct SmartMerger {
    keys: Vec<String>,
    keyset: HashSet<String>,
    rules: Vec<(Regex, String)>,
    replacements: HashSet<String>,
    pattern_strs: HashSet<String>,
    start_merging_on: usize,
    match_quality: f64,
}

impl SmartMerger {
    pub fn new(start_merging_on: usize) -> Self {
        Self::with_match_quality(start_merging_on, DEFAULT_MATCH_QUALITY)
    }

    pub fn with_match_quality(start_merging_on: usize, match_quality: f64) -> Self {
        Self {
            keys: Vec::new(),
            keyset: HashSet::new(),
            rules: Vec::new(),
            replacements: HashSet::new(),
            pattern_strs: HashSet::new(),
            start_merging_on,
            match_quality,
        }
    }

    /// Map a value onto its representative: known keys stay as they are,
    /// otherwise the first rule whose replacement equals the value or
    /// whose pattern matches wins.
    pub fn resolve(&self, value: &str) -> String {
        if self.keyset.contains(value) {
            return value.to_string();
        }
        for (pattern, replacement) in &self.rules {
            if value == replacement || pattern.is_match(value) {
                return replacement.clone();
            }
        }
        value.to_string()
    }

    pub fn is_replacement(&self, value: &str) -> bool {
        self.replacements.contains(value)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Add a key to the population. Crossing the threshold triggers rule
    /// discovery; the returned outcome carries the rewrites to apply.
    pub fn observe(&mut self, key: &str) -> MergeOutcome {
        if self.keyset.contains(key) {
            return MergeOutcome::default();
        }
        self.keyset.insert(key.to_string());
        self.keys.push(key.to_string());
        if self.keys.len() > self.start_merging_on {
            self.merge_values()
        } else {
            MergeOutcome::default()
        }
    }

    fn merge_values(&mut self) -> MergeOutcome {
        let generated = self.generate_rules();
        let mut new_rules = Vec::with_capacity(generated.len());
        let mut rewrites = Vec::new();
        let snapshot = self.keys.clone();
        for (pattern, pattern_str, replacement) in generated {
            new_rules.push((pattern_str, replacement.clone()));
            for key in &snapshot {
                if !self.keyset.contains(key) {
                    continue;
                }
                if *key != replacement
                    && !self.replacements.contains(key)
                    && pattern.is_match(key)
                {
                    self.keyset.remove(key);
                    self.keys.retain(|k| k != key);
                    if self.keyset.insert(replacement.clone()) {
                        self.keys.push(replacement.clone());
                    }
                    rewrites.push(Rewrite {
                        src: key.clone(),
                        dst: replacement.clone(),
                    });
                }
            }
        }
        MergeOutcome {
            new_rules,
            rewrites,
        }
    }

    /// Discover new rules over the current population. Pairs are examined
    /// longest-first; candidates below the quality bar are dropped;
    /// emission stops once the projected population is back under the
    /// threshold. Returns `(pattern, pattern source, replacement)` per
    /// emitted rule.
    fn generate_rules(&mut self) -> Vec<(Regex, String, String)> {
        let mut items = self.keys.clone();
        items.sort_by(|x, y| y.len().cmp(&x.len()));
        let n = items.len();

        // Candidate fragment tuples with (occurrences, quality sum),
        // insertion-ordered to keep tie-breaking deterministic.
        let mut order: Vec<Vec<String>> = Vec::new();
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        let mut tallies: Vec<(usize, f64)> = Vec::new();

        for i in 0..n.saturating_sub(1) {
            let a = &items[i];
            if self.replacements.contains(a) {
                continue;
            }
            let a_chars: Vec<char> = a.chars().collect();
            for (j, b) in items.iter().enumerate() {
                if j == i || self.replacements.contains(b) {
                    continue;
                }
                let b_chars: Vec<char> = b.chars().collect();
                let blocks = matching_blocks(&a_chars, &b_chars);
                let frags = fragments(&a_chars, b_chars.len(), &blocks);
                if frags.is_empty() {
                    continue;
                }
                let lm: usize = frags.iter().map(|f| f.chars().count()).sum();
                let mq = lm as f64 / a_chars.len().max(b_chars.len()) as f64;
                if mq < self.match_quality {
                    continue;
                }
                match index.get(&frags) {
                    Some(&at) => {
                        tallies[at].0 += 1;
                        tallies[at].1 += mq;
                    }
                    None => {
                        index.insert(frags.clone(), order.len());
                        order.push(frags);
                        tallies.push((1, mq));
                    }
                }
            }
        }

        // Compile candidates and score them.
        let mut candidates: Vec<(String, String, Regex, usize, f64)> = Vec::new();
        for (at, frags) in order.iter().enumerate() {
            let pattern_str = frags
                .iter()
                .map(|f| regex::escape(f))
                .collect::<Vec<_>>()
                .join(".*");
            let Ok(pattern) = Regex::new(&format!("^(?:{})", pattern_str)) else {
                continue;
            };
            let merged_count = self.keys.iter().filter(|k| pattern.is_match(k)).count();
            let (count, quality_sum) = tallies[at];
            let score = count as f64 * quality_sum * merged_count as f64;
            candidates.push((frags.join("*"), pattern_str, pattern, merged_count, score));
        }
        candidates.sort_by(|x, y| y.4.partial_cmp(&x.4).unwrap_or(Ordering::Equal));

        let mut emitted = Vec::new();
        let mut full_merged: usize = 0;
        for (replacement, pattern_str, pattern, merged_count, _) in candidates {
            if self.replacements.contains(&replacement) {
                continue;
            }
            if self.pattern_strs.contains(&pattern_str) {
                continue;
            }
            self.pattern_strs.insert(pattern_str.clone());
            self.replacements.insert(replacement.clone());
            self.rules.push((pattern.clone(), replacement.clone()));
            emitted.push((pattern, pattern_str, replacement));
            full_merged += merged_count;
            if (n as i64) - (full_merged as i64) + (emitted.len() as i64)
                < self.start_merging_on as i64
            {
                break;
            }
        }
        emitted
    }
}

/// Longest matching block within the given ranges; ties prefer the
/// earliest position in `a`, then in `b`.
fn longest_match(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0usize);
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for (i, ch) in a.iter().enumerate().take(ahi).skip(alo) {
        let mut newj2len: HashMap<usize, usize> = HashMap::new();
        if let Some(indices) = b2j.get(ch) {
            for &j in indices {
                if j < blo {
                    continue;
                }
                if j >= bhi {
                    break;
                }
                let k = if j > 0 {
                    j2len.get(&(j - 1)).copied().unwrap_or(0) + 1
                } else {
                    1
                };
                newj2len.insert(j, k);
                if k > bestsize {
                    besti = i + 1 - k;
                    bestj = j + 1 - k;
                    bestsize = k;
                }
            }
        }
        j2len = newj2len;
    }
    (besti, bestj, bestsize)
}

/// All matching blocks between `a` and `b`, sorted by position, with
/// adjacent blocks coalesced.
fn matching_blocks(a: &[char], b: &[char]) -> Vec<(usize, usize, usize)> {
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, ch) in b.iter().enumerate() {
        b2j.entry(*ch).or_default().push(j);
    }
    let mut queue = vec![(0usize, a.len(), 0usize, b.len())];
    let mut blocks = Vec::new();
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, k) = longest_match(a, &b2j, alo, ahi, blo, bhi);
        if k > 0 {
            blocks.push((i, j, k));
            if alo < i && blo < j {
                queue.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                queue.push((i + k, ahi, j + k, bhi));
            }
        }
    }
    blocks.sort_unstable();
    let mut merged: Vec<(usize, usize, usize)> = Vec::with_capacity(blocks.len());
    for (i, j, k) in blocks {
        if let Some(last) = merged.last_mut() {
            if last.0 + last.2 == i && last.1 + last.2 == j {
                last.2 += k;
                continue;
            }
        }
        merged.push((i, j, k));
    }
    merged
}

/// Turn matching blocks into the candidate fragment tuple: blocks shorter
/// than the threshold are dropped, and an empty fragment marks an
/// unmatched head or tail.
fn fragments(a: &[char], b_len: usize, blocks: &[(usize, usize, usize)]) -> Vec<String> {
    let kept: Vec<&(usize, usize, usize)> = blocks
        .iter()
        .filter(|(_, _, size)| *size >= MATCH_LEN_THRESHOLD)
        .collect();
    let count = kept.len();
    let mut out = Vec::new();
    for (idx, (ai, bi, size)) in kept.into_iter().enumerate() {
        if idx == 0 && (*ai > 0 || *bi > 0) {
            out.push(String::new());
        }
        out.push(a[*ai..*ai + *size].iter().collect());
        if idx + 1 == count && !(*ai + *size == a.len() && *bi + *size == b_len) {
            out.push(String::new());
        }
    }
    out
}
