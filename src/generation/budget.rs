//! Premium-model token budget and per-call model selection.
//!
//! One [`TokenBudget`] exists per pipeline run and is passed by `&mut` through batch
//! execution. Premium tokens are reserved before a fan-out starts and settled against the
//! reported usage once the call returns, so concurrent calls in one batch can never
//! overspend the budget between them.

use crate::config::{BudgetConfig, ModelSpec, ModelsConfig};
use crate::job::FilePlanEntry;
use crate::provider::TokenUsage;

/// Expected completion size of one generated file, added to the prompt estimate.
pub const EXPECTED_OUTPUT_TOKENS: u32 = 3_000;

/// Path or purpose keywords that make a file eligible for the premium model.
pub const PRIORITY_KEYWORDS: &[&str] = &[
    "core",
    "critical",
    "main",
    "dashboard",
    "auth",
    "login",
    "api",
    "checkout",
    "app",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationKind {
    File,
    Foundation,
    Consistency,
}

/// Premium tokens held for one in-flight call. Must be settled or released exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    amount: u32,
    kind: ReservationKind,
}

impl Reservation {
    pub fn amount(&self) -> u32 {
        self.amount
    }
}

#[derive(Debug, Clone)]
pub struct TokenBudget {
    total: u32,
    consistency_reserve: u32,
    foundation_allowance: u32,
    spent: u32,
    held: u32,
    consistency_claimed: bool,
}

impl TokenBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            total: config.total,
            consistency_reserve: config.consistency_reserve,
            foundation_allowance: config.foundation_allowance,
            spent: 0,
            held: 0,
            consistency_claimed: false,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn spent(&self) -> u32 {
        self.spent
    }

    /// Unspent and unreserved premium tokens, consistency reserve included.
    pub fn remaining(&self) -> u32 {
        self.total
            .saturating_sub(self.spent.saturating_add(self.held))
    }

    /// Premium tokens available to file generation. The consistency reserve stays out of
    /// reach until the consistency pass claims it.
    pub fn available_for_files(&self) -> u32 {
        if self.consistency_claimed {
            self.remaining()
        } else {
            self.remaining().saturating_sub(self.consistency_reserve)
        }
    }

    pub fn reserve_file(&mut self, estimate: u32) -> Option<Reservation> {
        if estimate == 0 || estimate > self.available_for_files() {
            return None;
        }
        Some(self.hold(estimate, ReservationKind::File))
    }

    /// The foundation call takes its whole allowance or nothing.
    pub fn reserve_foundation(&mut self) -> Option<Reservation> {
        let amount = self.foundation_allowance;
        if amount == 0 || amount > self.available_for_files() {
            return None;
        }
        Some(self.hold(amount, ReservationKind::Foundation))
    }

    pub fn reserve_consistency(&mut self) -> Option<Reservation> {
        let amount = self.consistency_reserve.min(self.remaining());
        if amount == 0 || self.consistency_claimed {
            return None;
        }
        self.consistency_claimed = true;
        Some(self.hold(amount, ReservationKind::Consistency))
    }

    /// Charge a completed call. The foundation allowance is consumed in full regardless of
    /// reported usage; other calls are charged what the provider reported, or the reserved
    /// estimate when no usage came back.
    pub fn settle(&mut self, reservation: Reservation, usage: Option<TokenUsage>) {
        self.held = self.held.saturating_sub(reservation.amount);
        let charge = match reservation.kind {
            ReservationKind::Foundation => reservation.amount,
            ReservationKind::File | ReservationKind::Consistency => usage
                .map(|usage| usage.total_tokens)
                .unwrap_or(reservation.amount),
        };
        self.spent = self.spent.saturating_add(charge);
    }

    /// Return the tokens of a call that never produced a response.
    pub fn release(&mut self, reservation: Reservation) {
        self.held = self.held.saturating_sub(reservation.amount);
    }

    fn hold(&mut self, amount: u32, kind: ReservationKind) -> Reservation {
        self.held = self.held.saturating_add(amount);
        Reservation { amount, kind }
    }
}

/// Rough token count of a prompt plus the expected size of the generated file.
pub fn estimate_file_tokens(prompt_chars: usize) -> u32 {
    let prompt_tokens = u32::try_from(prompt_chars / 4).unwrap_or(u32::MAX);
    prompt_tokens.saturating_add(EXPECTED_OUTPUT_TOKENS)
}

pub fn is_priority_file(entry: &FilePlanEntry) -> bool {
    let haystack = format!("{} {}", entry.path, entry.purpose).to_ascii_lowercase();
    PRIORITY_KEYWORDS
        .iter()
        .any(|keyword| haystack.contains(keyword))
}

/// The model picked for one call and, for premium picks, the tokens held for it.
#[derive(Debug)]
pub struct ModelChoice {
    pub model: ModelSpec,
    pub reservation: Option<Reservation>,
}

impl ModelChoice {
    pub fn is_premium(&self) -> bool {
        self.reservation.is_some()
    }

    fn fallback(models: &ModelsConfig) -> Self {
        Self {
            model: models.fallback.clone(),
            reservation: None,
        }
    }

    fn premium(models: &ModelsConfig, reservation: Reservation) -> Self {
        Self {
            model: models.premium.clone(),
            reservation: Some(reservation),
        }
    }

    /// Hand the reservation back to the budget with the call's outcome.
    pub fn settle(self, budget: &mut TokenBudget, usage: Option<TokenUsage>, responded: bool) {
        if let Some(reservation) = self.reservation {
            if responded {
                budget.settle(reservation, usage);
            } else {
                budget.release(reservation);
            }
        }
    }
}

/// Premium only for priority files that still fit in the budget; everything else falls back.
pub fn choose_for_file(
    budget: &mut TokenBudget,
    models: &ModelsConfig,
    entry: &FilePlanEntry,
    estimate: u32,
) -> ModelChoice {
    if !is_priority_file(entry) {
        return ModelChoice::fallback(models);
    }
    match budget.reserve_file(estimate) {
        Some(reservation) => ModelChoice::premium(models, reservation),
        None => ModelChoice::fallback(models),
    }
}

pub fn choose_for_foundation(budget: &mut TokenBudget, models: &ModelsConfig) -> ModelChoice {
    match budget.reserve_foundation() {
        Some(reservation) => ModelChoice::premium(models, reservation),
        None => ModelChoice::fallback(models),
    }
}

pub fn choose_for_consistency(budget: &mut TokenBudget, models: &ModelsConfig) -> ModelChoice {
    match budget.reserve_consistency() {
        Some(reservation) => ModelChoice::premium(models, reservation),
        None => ModelChoice::fallback(models),
    }
}
