//! Token budget allocation and the per-run usage ledger.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::intent::StepIntent;
use crate::config::BudgetConfig;
use crate::error::StepErrorKind;
use crate::events::EventSink;

/// How a run's token pool is split across steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Same share for every step
    Equal,
    /// Share proportional to the intent's base weight
    Proportional,
    /// Proportional, with generative intents growing with complexity
    #[default]
    Adaptive,
    /// Highest-priority intents are served first
    Priority,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::Equal => "equal",
            AllocationStrategy::Proportional => "proportional",
            AllocationStrategy::Adaptive => "adaptive",
            AllocationStrategy::Priority => "priority",
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "equal" => Ok(AllocationStrategy::Equal),
            "proportional" => Ok(AllocationStrategy::Proportional),
            "adaptive" => Ok(AllocationStrategy::Adaptive),
            "priority" => Ok(AllocationStrategy::Priority),
            other => Err(format!(
                "unknown allocation strategy '{}', expected equal/proportional/adaptive/priority",
                other
            )),
        }
    }
}

/// Budget of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub step_id: String,
    pub intent: StepIntent,
    pub budget_tokens: u64,
    pub used_tokens: u64,
}

impl TokenBudget {
    pub fn remaining(&self) -> u64 {
        self.budget_tokens.saturating_sub(self.used_tokens)
    }

    /// Usage beyond which generation stops.
    pub fn hard_limit(&self, tolerance: f64) -> u64 {
        (self.budget_tokens as f64 * (1.0 + tolerance.max(0.0))).floor() as u64
    }
}

/// Scale factor for an agent complexity score in `0..=10`.
fn complexity_scale(complexity: f64) -> f64 {
    0.5 + complexity.clamp(0.0, 10.0) / 20.0
}

/// Split `total_tokens` across steps.
///
/// The pool is scaled by complexity first (`0` → half the pool, `10` → all
/// of it). Allocations never sum to more than the scaled pool.
pub fn allocate_budget(
    steps: &[(String, StepIntent)],
    complexity: f64,
    strategy: AllocationStrategy,
    total_tokens: u64,
) -> HashMap<String, TokenBudget> {
    if steps.is_empty() {
        return HashMap::new();
    }
    let pool = (total_tokens as f64 * complexity_scale(complexity)).floor();
    let level = complexity.clamp(0.0, 10.0) / 10.0;

    let shares: Vec<f64> = match strategy {
        AllocationStrategy::Equal => vec![pool / steps.len() as f64; steps.len()],
        AllocationStrategy::Proportional => {
            proportional(pool, steps.iter().map(|(_, i)| i.base_weight()))
        }
        AllocationStrategy::Adaptive => proportional(
            pool,
            steps
                .iter()
                .map(|(_, i)| i.base_weight() * (1.0 + level * i.complexity_sensitivity())),
        ),
        AllocationStrategy::Priority => {
            let demand = proportional(pool, steps.iter().map(|(_, i)| i.base_weight()));
            let mut order: Vec<usize> = (0..steps.len()).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(steps[i].1.priority()));

            let mut remaining = pool;
            let mut shares = vec![0.0; steps.len()];
            for i in order {
                let grant = (demand[i] * 1.5).min(remaining);
                shares[i] = grant;
                remaining -= grant;
            }
            shares
        }
    };

    steps
        .iter()
        .zip(shares)
        .map(|((id, intent), share)| {
            (
                id.clone(),
                TokenBudget {
                    step_id: id.clone(),
                    intent: *intent,
                    budget_tokens: share.floor() as u64,
                    used_tokens: 0,
                },
            )
        })
        .collect()
}

fn proportional(pool: f64, weights: impl Iterator<Item = f64>) -> Vec<f64> {
    let weights: Vec<f64> = weights.collect();
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return vec![pool / weights.len().max(1) as f64; weights.len()];
    }
    weights.iter().map(|w| pool * w / sum).collect()
}

/// Outcome of recording usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStatus {
    /// Step has no allocation; usage is not gated
    Unbudgeted,
    WithinBudget { remaining: u64 },
    /// Over budget but within tolerance
    Overage { used: u64, limit: u64 },
    /// Past the hard limit; further generation is refused
    Exhausted { used: u64, limit: u64 },
}

struct LedgerEntry {
    budget: TokenBudget,
    /// Tokens held by calls in flight
    reserved: u64,
    /// Calls whose usage has been reported
    settled_calls: u64,
}

impl LedgerEntry {
    /// Tokens one more call is expected to use.
    fn estimate(&self, default: u64) -> u64 {
        if self.settled_calls > 0 {
            self.budget.used_tokens / self.settled_calls
        } else {
            default.min(self.budget.budget_tokens)
        }
    }
}

/// Per-run token ledger.
///
/// Every read-modify-write happens under one mutex, so concurrent scatter
/// branches sharing a step's budget see consistent totals. Calls in flight
/// hold a reservation that counts against the hard limit until they settle.
pub struct TokenBudgetManager {
    overage_tolerance: f64,
    reservation_tokens: u64,
    ledger: Mutex<HashMap<String, LedgerEntry>>,
    events: EventSink,
}

impl TokenBudgetManager {
    pub fn new(config: &BudgetConfig, events: EventSink) -> Self {
        Self {
            overage_tolerance: config.overage_tolerance,
            reservation_tokens: config.reservation_tokens,
            ledger: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install allocations, replacing any existing entry for the same step.
    pub fn install(&self, budgets: HashMap<String, TokenBudget>) {
        self.ledger().extend(budgets.into_iter().map(|(id, budget)| {
            (
                id,
                LedgerEntry {
                    budget,
                    reserved: 0,
                    settled_calls: 0,
                },
            )
        }));
    }

    /// Current status of a step's budget.
    pub fn check_budget(&self, step_id: &str) -> UsageStatus {
        match self.ledger().get(step_id) {
            Some(entry) => self.status_of(&entry.budget),
            None => UsageStatus::Unbudgeted,
        }
    }

    fn status_of(&self, budget: &TokenBudget) -> UsageStatus {
        let limit = budget.hard_limit(self.overage_tolerance);
        if limit == 0 || budget.used_tokens >= limit {
            UsageStatus::Exhausted {
                used: budget.used_tokens,
                limit,
            }
        } else if budget.used_tokens > budget.budget_tokens {
            UsageStatus::Overage {
                used: budget.used_tokens,
                limit: budget.budget_tokens,
            }
        } else {
            UsageStatus::WithinBudget {
                remaining: budget.remaining(),
            }
        }
    }

    /// Gate a generation-heavy call and reserve its expected usage.
    ///
    /// Check and reservation happen under one lock. A lone call only needs
    /// the step to be under its hard limit; with other calls in flight, the
    /// new reservation must also fit. Returns the reserved tokens, which the
    /// caller hands back to [`settle_generation`](Self::settle_generation).
    pub fn begin_generation(&self, step_id: &str) -> Result<u64, StepErrorKind> {
        let mut ledger = self.ledger();
        let Some(entry) = ledger.get_mut(step_id) else {
            return Ok(0);
        };
        let limit = entry.budget.hard_limit(self.overage_tolerance);
        let used = entry.budget.used_tokens;
        let estimate = entry.estimate(self.reservation_tokens);
        let committed = used.saturating_add(entry.reserved);

        let refused = limit == 0
            || used >= limit
            || (entry.reserved > 0 && committed.saturating_add(estimate) > limit);
        if refused {
            warn!(
                step_id,
                used,
                reserved = entry.reserved,
                limit,
                "Generation refused: token budget exhausted"
            );
            return Err(StepErrorKind::BudgetExceeded {
                used: committed,
                limit,
            });
        }

        entry.reserved = entry.reserved.saturating_add(estimate);
        debug!(step_id, estimate, reserved = entry.reserved, "Reserved tokens");
        Ok(estimate)
    }

    /// Release a reservation and record the call's usage, if it reported any.
    pub fn settle_generation(&self, step_id: &str, reserved: u64, tokens: Option<u64>) -> UsageStatus {
        self.record(step_id, reserved, tokens)
    }

    /// Add usage and report the resulting status.
    pub fn track_usage(&self, step_id: &str, tokens: u64) -> UsageStatus {
        self.record(step_id, 0, Some(tokens))
    }

    fn record(&self, step_id: &str, reserved: u64, tokens: Option<u64>) -> UsageStatus {
        let (status, intent) = {
            let mut ledger = self.ledger();
            let Some(entry) = ledger.get_mut(step_id) else {
                return UsageStatus::Unbudgeted;
            };
            entry.reserved = entry.reserved.saturating_sub(reserved);
            let Some(tokens) = tokens else {
                return self.status_of(&entry.budget);
            };
            let budget = &mut entry.budget;
            let was_over = budget.used_tokens > budget.budget_tokens;
            budget.used_tokens = budget.used_tokens.saturating_add(tokens);
            entry.settled_calls += 1;
            let crossed = !was_over && budget.used_tokens > budget.budget_tokens;
            let status = self.status_of(budget);
            (status, crossed.then_some(budget.intent))
        };

        debug!(step_id, ?tokens, ?status, "Tracked token usage");
        if let Some(intent) = intent {
            if let UsageStatus::Overage { used, limit } | UsageStatus::Exhausted { used, limit } = status {
                warn!(step_id, used, limit, intent = %intent, "Token budget overage");
                crate::metrics::record_budget_overage(intent.as_str());
                self.events.budget_overage(step_id, used, limit);
            }
        }
        status
    }

    /// Tokens currently held by calls in flight.
    pub fn reserved(&self, step_id: &str) -> u64 {
        self.ledger().get(step_id).map(|e| e.reserved).unwrap_or(0)
    }

    pub fn get(&self, step_id: &str) -> Option<TokenBudget> {
        self.ledger().get(step_id).map(|e| e.budget.clone())
    }

    /// Every budget, sorted by step id.
    pub fn report(&self) -> Vec<TokenBudget> {
        let mut all: Vec<TokenBudget> = self.ledger().values().map(|e| e.budget.clone()).collect();
        all.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        all
    }

    pub fn total_used(&self) -> u64 {
        self.ledger().values().map(|e| e.budget.used_tokens).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn steps() -> Vec<(String, StepIntent)> {
        vec![
            ("step1".into(), StepIntent::Classify),
            ("step2".into(), StepIntent::Summarize),
            ("step3".into(), StepIntent::Generate),
        ]
    }

    fn sum(budgets: &HashMap<String, TokenBudget>) -> u64 {
        budgets.values().map(|b| b.budget_tokens).sum()
    }

    #[test]
    fn test_equal_allocation() {
        let budgets = allocate_budget(&steps(), 10.0, AllocationStrategy::Equal, 9000);
        assert!(budgets.values().all(|b| b.budget_tokens == 3000));
    }

    #[test]
    fn test_complexity_scales_pool() {
        let low = allocate_budget(&steps(), 0.0, AllocationStrategy::Proportional, 10_000);
        let high = allocate_budget(&steps(), 10.0, AllocationStrategy::Proportional, 10_000);
        assert!(sum(&low) <= 5000);
        assert!(sum(&high) <= 10_000);
        assert!(sum(&high) > sum(&low));
    }

    #[test]
    fn test_adaptive_favors_generation_at_high_complexity() {
        let calm = allocate_budget(&steps(), 0.0, AllocationStrategy::Adaptive, 10_000);
        let busy = allocate_budget(&steps(), 10.0, AllocationStrategy::Adaptive, 10_000);
        let share = |b: &HashMap<String, TokenBudget>| b["step3"].budget_tokens as f64 / sum(b) as f64;
        assert!(share(&busy) > share(&calm));
    }

    #[test]
    fn test_priority_serves_high_priority_first() {
        let budgets = allocate_budget(&steps(), 10.0, AllocationStrategy::Priority, 8000);
        assert!(sum(&budgets) <= 8000);
        assert!(budgets["step1"].budget_tokens > 0);
        assert!(budgets["step2"].budget_tokens > 0);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Priority".parse::<AllocationStrategy>().unwrap(), AllocationStrategy::Priority);
        assert!("greedy".parse::<AllocationStrategy>().is_err());
    }

    fn manager(budget: u64) -> TokenBudgetManager {
        let manager = TokenBudgetManager::new(&BudgetConfig::default(), EventSink::new());
        let mut budgets = HashMap::new();
        budgets.insert(
            "step2".to_string(),
            TokenBudget {
                step_id: "step2".into(),
                intent: StepIntent::Summarize,
                budget_tokens: budget,
                used_tokens: 0,
            },
        );
        manager.install(budgets);
        manager
    }

    #[test]
    fn test_overage_tolerance_then_hard_stop() {
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let manager = TokenBudgetManager::new(&BudgetConfig::default(), events);
        manager.install(
            [(
                "step2".to_string(),
                TokenBudget {
                    step_id: "step2".into(),
                    intent: StepIntent::Summarize,
                    budget_tokens: 1000,
                    used_tokens: 0,
                },
            )]
            .into_iter()
            .collect(),
        );

        assert_eq!(manager.track_usage("step2", 900), UsageStatus::WithinBudget { remaining: 100 });
        let held = manager.begin_generation("step2").unwrap();
        assert_eq!(
            manager.settle_generation("step2", held, Some(150)),
            UsageStatus::Overage { used: 1050, limit: 1000 }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            crate::events::RunEvent::BudgetOverage { used: 1050, .. }
        ));

        let held = manager.begin_generation("step2").unwrap();
        assert_eq!(
            manager.settle_generation("step2", held, Some(60)),
            UsageStatus::Exhausted { used: 1110, limit: 1100 }
        );
        assert_eq!(manager.reserved("step2"), 0);
        assert!(matches!(
            manager.begin_generation("step2"),
            Err(StepErrorKind::BudgetExceeded { used: 1110, limit: 1100 })
        ));
    }

    #[test]
    fn test_unbudgeted_steps_are_not_gated() {
        let manager = manager(10);
        assert_eq!(manager.track_usage("step9", 5000), UsageStatus::Unbudgeted);
        assert_eq!(manager.begin_generation("step9"), Ok(0));
    }

    #[test]
    fn test_in_flight_reservations_count_against_limit() {
        // Budget 1000, hard limit 1100, 500 tokens held per call in flight.
        let manager = manager(1000);
        assert_eq!(manager.begin_generation("step2"), Ok(500));
        assert_eq!(manager.begin_generation("step2"), Ok(500));
        assert!(matches!(
            manager.begin_generation("step2"),
            Err(StepErrorKind::BudgetExceeded { used: 1000, limit: 1100 })
        ));
        assert_eq!(manager.reserved("step2"), 1000);

        manager.settle_generation("step2", 500, Some(700));
        manager.settle_generation("step2", 500, Some(700));
        assert_eq!(manager.reserved("step2"), 0);
        assert!(manager.begin_generation("step2").is_err());
    }

    #[test]
    fn test_failed_call_releases_reservation() {
        let manager = manager(1000);
        let held = manager.begin_generation("step2").unwrap();
        manager.settle_generation("step2", held, None);
        assert_eq!(manager.reserved("step2"), 0);
        assert_eq!(manager.get("step2").unwrap().used_tokens, 0);
    }

    #[test]
    fn test_estimate_follows_reported_usage() {
        let manager = manager(1000);
        manager.track_usage("step2", 100);
        manager.track_usage("step2", 300);
        assert_eq!(manager.begin_generation("step2"), Ok(200));
    }

    #[test]
    fn test_concurrent_usage_is_atomic() {
        let manager = Arc::new(manager(1_000_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.track_usage("step2", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(manager.get("step2").unwrap().used_tokens, 8000);
    }
}
