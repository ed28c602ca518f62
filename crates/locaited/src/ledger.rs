//! Cost Ledger
//!
//! Process-wide accumulator of calls, cache hits, tokens and dollars, keyed
//! by run and stage. Counters are atomics behind a concurrent map so that
//! parallel searches inside one stage never lose an increment.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::stages::StageKind;

const NANOS_PER_USD: f64 = 1_000_000_000.0;

fn to_nanos(usd: f64) -> u64 {
    if usd <= 0.0 {
        0
    } else {
        (usd * NANOS_PER_USD).round() as u64
    }
}

fn from_nanos(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_USD
}

/// What a single external call consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

impl CallUsage {
    /// Flat-priced call with no token accounting (web search)
    pub fn flat(cost_usd: f64) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cost_usd,
        }
    }

    pub fn tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Snapshot of accumulated spend
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// External calls actually made (cache misses)
    pub calls: u64,
    pub cache_hits: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl StageMetrics {
    pub fn add(&mut self, other: &StageMetrics) {
        self.calls += other.calls;
        self.cache_hits += other.cache_hits;
        self.tokens += other.tokens;
        self.cost_usd += other.cost_usd;
    }

    /// Spend accumulated after `earlier` was taken
    pub fn since(&self, earlier: &StageMetrics) -> StageMetrics {
        StageMetrics {
            calls: self.calls.saturating_sub(earlier.calls),
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            tokens: self.tokens.saturating_sub(earlier.tokens),
            cost_usd: (self.cost_usd - earlier.cost_usd).max(0.0),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    tokens: AtomicU64,
    cost_nanos: AtomicU64,
}

impl Counters {
    fn record(&self, usage: &CallUsage, cache_hit: bool) {
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(usage.tokens(), Ordering::Relaxed);
        self.cost_nanos
            .fetch_add(to_nanos(usage.cost_usd), Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageMetrics {
        StageMetrics {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            cost_usd: from_nanos(self.cost_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Per-stage and total spend for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub per_stage: BTreeMap<StageKind, StageMetrics>,
    pub run_total: StageMetrics,
}

#[derive(Debug, Default)]
pub struct CostLedger {
    entries: DashMap<(Uuid, StageKind), Counters>,
    lifetime: Counters,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call. Hits count toward `cache_hits` only; their cost is zero.
    pub fn record(&self, run_id: Uuid, stage: StageKind, usage: &CallUsage, cache_hit: bool) {
        self.entries
            .entry((run_id, stage))
            .or_default()
            .record(usage, cache_hit);
        self.lifetime.record(usage, cache_hit);
    }

    pub fn stage_totals(&self, run_id: Uuid, stage: StageKind) -> StageMetrics {
        self.entries
            .get(&(run_id, stage))
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn totals(&self, run_id: Uuid) -> LedgerTotals {
        let mut totals = LedgerTotals::default();
        for entry in self.entries.iter() {
            let (entry_run, stage) = *entry.key();
            if entry_run != run_id {
                continue;
            }
            let snapshot = entry.value().snapshot();
            totals.run_total.add(&snapshot);
            totals.per_stage.insert(stage, snapshot);
        }
        totals
    }

    pub fn spent_usd(&self, run_id: Uuid) -> f64 {
        self.totals(run_id).run_total.cost_usd
    }

    /// Whether a new call estimated at `estimate_usd` would take the run past `cap_usd`
    pub fn would_exceed(&self, run_id: Uuid, cap_usd: f64, estimate_usd: f64) -> bool {
        self.spent_usd(run_id) + estimate_usd.max(0.0) > cap_usd
    }

    /// Drop everything recorded for a run
    pub fn reset(&self, run_id: Uuid) {
        self.entries.retain(|(entry_run, _), _| *entry_run != run_id);
    }

    /// Totals across every run since process start
    pub fn lifetime(&self) -> StageMetrics {
        self.lifetime.snapshot()
    }
}

/// Per-run handle onto the shared ledger, carrying the run's budget and cache policy
#[derive(Debug, Clone)]
pub struct RunMeter {
    run_id: Uuid,
    ledger: Arc<CostLedger>,
    budget_cap_usd: Option<f64>,
    use_cache: bool,
}

impl RunMeter {
    pub fn new(
        run_id: Uuid,
        ledger: Arc<CostLedger>,
        budget_cap_usd: Option<f64>,
        use_cache: bool,
    ) -> Self {
        Self {
            run_id,
            ledger,
            budget_cap_usd,
            use_cache,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn budget_cap_usd(&self) -> Option<f64> {
        self.budget_cap_usd
    }

    pub fn record(&self, stage: StageKind, usage: &CallUsage, cache_hit: bool) {
        self.ledger.record(self.run_id, stage, usage, cache_hit);
    }

    pub fn would_exceed(&self, estimate_usd: f64) -> bool {
        match self.budget_cap_usd {
            Some(cap) => self.ledger.would_exceed(self.run_id, cap, estimate_usd),
            None => false,
        }
    }

    pub fn spent_usd(&self) -> f64 {
        self.ledger.spent_usd(self.run_id)
    }

    pub fn stage_totals(&self, stage: StageKind) -> StageMetrics {
        self.ledger.stage_totals(self.run_id, stage)
    }

    pub fn totals(&self) -> LedgerTotals {
        self.ledger.totals(self.run_id)
    }
}
