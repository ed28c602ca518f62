//! Near-duplicate merging
//!
//! Similarity is symmetric and deterministic. Pairs above the threshold are
//! merged transitively, so the output contains no pair above the threshold
//! and running the engine on its own output changes nothing.

use std::{cmp::Ordering, collections::BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::scoring::{completeness, parse_event_date, ScoringContext};
use crate::workflow::Event;

const TITLE_WEIGHT: f64 = 0.5;
const DATE_WEIGHT: f64 = 0.25;
const LOCATION_WEIGHT: f64 = 0.25;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("valid token regex"));

const STOPWORDS: &[&str] = &["the", "a", "an"];

fn tokens(value: &str) -> BTreeSet<String> {
    NON_ALNUM
        .split(&value.to_lowercase())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

fn normalized_date(value: &str) -> String {
    parse_event_date(value)
        .map(|d| d.to_string())
        .unwrap_or_else(|| value.trim().to_lowercase())
}

pub fn title_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (tokens(a), tokens(b));
    (jaccard(&a, &b) + overlap(&a, &b)) / 2.0
}

pub fn location_similarity(a: &str, b: &str) -> f64 {
    overlap(&tokens(a), &tokens(b))
}

/// Weighted similarity of title, date and location, in [0, 1]
pub fn similarity(a: &Event, b: &Event) -> f64 {
    let (date_a, date_b) = (normalized_date(&a.date), normalized_date(&b.date));
    let date = match (date_a.is_empty(), date_b.is_empty()) {
        (true, true) => 0.5,
        _ if date_a == date_b => 1.0,
        _ => 0.0,
    };
    TITLE_WEIGHT * title_similarity(&a.title, &b.title)
        + DATE_WEIGHT * date
        + LOCATION_WEIGHT * location_similarity(&a.location, &b.location)
}

/// Stable id derived from the representative's normalized content
pub fn group_id(event: &Event) -> String {
    let title: Vec<String> = tokens(&event.title).into_iter().collect();
    let location: Vec<String> = tokens(&event.location).into_iter().collect();
    let mut hasher = Sha256::new();
    hasher.update(title.join(" ").as_bytes());
    hasher.update(b"|");
    hasher.update(normalized_date(&event.date).as_bytes());
    hasher.update(b"|");
    hasher.update(location.join(" ").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("grp-{}", &digest[..12])
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = i;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// Representative preference: more complete, then higher raw score, then seen first
fn prefer(a: (usize, &Event), b: (usize, &Event)) -> Ordering {
    completeness(b.1)
        .cmp(&completeness(a.1))
        .then(b.1.raw_score.cmp(&a.1.raw_score))
        .then(a.0.cmp(&b.0))
}

/// Ranking order: score descending, then earliest date, then id
pub fn rank(a: &Event, b: &Event) -> Ordering {
    let date_a = parse_event_date(&a.date);
    let date_b = parse_event_date(&b.date);
    let by_date = match (date_a, date_b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    b.score
        .cmp(&a.score)
        .then(by_date)
        .then_with(|| a.id.cmp(&b.id))
}

pub struct DedupEngine {
    threshold: f64,
    scoring: ScoringContext,
}

impl DedupEngine {
    pub fn new(threshold: f64, scoring: ScoringContext) -> Self {
        Self { threshold, scoring }
    }

    pub fn scoring(&self) -> &ScoringContext {
        &self.scoring
    }

    /// Drop unspecific events, merge near-duplicates, score each
    /// representative and rank the result
    pub fn process(&self, events: Vec<Event>) -> Vec<Event> {
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| !e.date.trim().is_empty() && !e.location.trim().is_empty())
            .collect();
        let n = events.len();
        let mut parent: Vec<usize> = (0..n).collect();

        for i in 0..n {
            for j in (i + 1)..n {
                if similarity(&events[i], &events[j]) > self.threshold {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    if ri != rj {
                        parent[ri.max(rj)] = ri.min(rj);
                    }
                }
            }
        }

        // (group root, chosen member), in first-seen group order
        let mut groups: Vec<(usize, usize)> = Vec::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            match groups.iter_mut().find(|(r, _)| *r == root) {
                Some((_, current)) => {
                    if prefer((i, &events[i]), (*current, &events[*current])) == Ordering::Less {
                        *current = i;
                    }
                }
                None => groups.push((root, i)),
            }
        }
        let representatives: Vec<usize> = groups.into_iter().map(|(_, i)| i).collect();

        let merged = n - representatives.len();
        if merged > 0 {
            tracing::debug!("[DEDUP] merged {} near-duplicate events", merged);
        }

        let mut output: Vec<Event> = representatives
            .into_iter()
            .map(|i| {
                let mut event = events[i].clone();
                let (score, rationale) = self.scoring.score(&event);
                event.score = score;
                event.rationale = rationale;
                event.dedup_group_id = group_id(&event);
                event
            })
            .collect();

        output.sort_by(rank);
        output
    }
}
