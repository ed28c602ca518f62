use chrono::NaiveDate;

use crate::workflow::Event;

const DATE_POINTS: u32 = 12;
const LOCATION_POINTS: u32 = 12;
const TIME_POINTS: u32 = 8;
const SOURCE_POINTS: u32 = 8;
const PROXIMITY_POINTS: f64 = 30.0;
const UNDATED_PROXIMITY_POINTS: f64 = 10.0;
const RELEVANCE_POINTS: f64 = 30.0;

/// What an event is scored against
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub reference_date: NaiveDate,
    pub window_days: u32,
    pub interests: Vec<String>,
}

/// Parse the date formats extraction commonly yields
pub fn parse_event_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    ["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%m/%d/%Y", "%d %B %Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Completeness component (0..=40)
pub fn completeness(event: &Event) -> u32 {
    let mut points = 0;
    if !event.date.trim().is_empty() {
        points += DATE_POINTS;
    }
    if !event.location.trim().is_empty() {
        points += LOCATION_POINTS;
    }
    if present(&event.time) {
        points += TIME_POINTS;
    }
    if present(&event.source_url) {
        points += SOURCE_POINTS;
    }
    points
}

impl ScoringContext {
    /// Proximity component (0..=30): full marks today, half at the window's
    /// end, nothing outside the window
    pub fn proximity(&self, event: &Event) -> f64 {
        let Some(date) = parse_event_date(&event.date) else {
            return UNDATED_PROXIMITY_POINTS;
        };
        let days_out = (date - self.reference_date).num_days();
        let window = self.window_days.max(1) as i64;
        if days_out < 0 || days_out > window {
            return 0.0;
        }
        PROXIMITY_POINTS * (1.0 - 0.5 * days_out as f64 / window as f64)
    }

    /// Share of interests mentioned in the title or description
    pub fn interest_overlap(&self, event: &Event) -> f64 {
        if self.interests.is_empty() {
            return 0.0;
        }
        let haystack = format!("{} {}", event.title, event.description).to_lowercase();
        let matched = self
            .interests
            .iter()
            .filter(|interest| {
                interest
                    .to_lowercase()
                    .split_whitespace()
                    .any(|term| term.len() > 2 && haystack.contains(term))
            })
            .count();
        matched as f64 / self.interests.len() as f64
    }

    /// Relevance component (0..=30)
    pub fn relevance(&self, event: &Event) -> f64 {
        let raw = event.raw_score.min(100) as f64 / 100.0;
        RELEVANCE_POINTS * 0.5 * raw + RELEVANCE_POINTS * 0.5 * self.interest_overlap(event)
    }

    /// Final score and a short rationale
    pub fn score(&self, event: &Event) -> (u8, String) {
        let completeness = completeness(event) as f64;
        let proximity = self.proximity(event);
        let relevance = self.relevance(event);
        let total = (completeness + proximity + relevance).round().clamp(0.0, 100.0) as u8;
        let rationale = format!(
            "completeness {:.0}/40, proximity {:.0}/30, relevance {:.0}/30",
            completeness, proximity, relevance
        );
        (total, rationale)
    }
}
