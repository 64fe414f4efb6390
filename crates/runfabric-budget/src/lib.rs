//! Token budget accounting for a single agent run (spec §4.2), grounded on
//! `original_source/app/core/budget.py`'s `BudgetManager`/`Reservation`.
//!
//! A `BudgetManager` is owned by exactly one worker task for the lifetime of
//! a run (spec §5's concurrency note), so every mutating method takes
//! `&mut self` rather than reaching for interior mutability or a lock. The
//! Python original aliases a mutable `Reservation` object between the
//! manager's internal dict and the caller; here a reservation is instead a
//! `ReservationHandle` (just the label) and all mutation goes back through
//! `&mut BudgetManager` — no `Rc<RefCell<_>>`, and the future holding a
//! `BudgetManager` across `.await` stays `Send`.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BudgetError {
    #[error("Budget exhausted: requested {requested} tokens, only {remaining} remaining")]
    Exhausted { requested: u64, remaining: u64 },
    #[error("Reservation '{0}' already exists")]
    ReservationExists(String),
    #[error("Reservation '{0}' not found")]
    ReservationNotFound(String),
}

impl BudgetError {
    /// The stable error-taxonomy code (spec §7).
    pub fn code(&self) -> &'static str {
        match self {
            BudgetError::Exhausted { .. } => "budget_exhausted",
            BudgetError::ReservationExists(_) | BudgetError::ReservationNotFound(_) => {
                "reservation_error"
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    allocated: u64,
    consumed: u64,
}

impl Reservation {
    fn remaining(&self) -> u64 {
        self.allocated - self.consumed
    }
}

/// An opaque handle returned by [`BudgetManager::reserve`]. Carries the
/// label so `consume`/`release` can look the reservation back up; holding
/// one does not keep the manager borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationHandle {
    pub label: String,
    pub allocated: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReservationSnapshot {
    pub allocated: u64,
    pub consumed: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BudgetSnapshot {
    pub total: u64,
    pub consumed: u64,
    pub remaining: u64,
    pub hard_remaining: u64,
    pub reservations: HashMap<String, ReservationSnapshot>,
}

#[derive(Debug, Clone)]
pub struct BudgetManager {
    total: u64,
    consumed: u64,
    reservations: HashMap<String, Reservation>,
}

impl BudgetManager {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            consumed: 0,
            reservations: HashMap::new(),
        }
    }

    pub fn for_profile(profile: runfabric_types::AgentProfile) -> Self {
        Self::new(profile.default_budget_tokens())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Tokens available once active reservations are carved out.
    pub fn remaining(&self) -> u64 {
        let reserved: u64 = self.reservations.values().map(Reservation::remaining).sum();
        self.total.saturating_sub(self.consumed).saturating_sub(reserved)
    }

    /// Tokens remaining ignoring reservations (`total - consumed`).
    pub fn hard_remaining(&self) -> u64 {
        self.total.saturating_sub(self.consumed)
    }

    pub fn check(&self, tokens: u64) -> bool {
        tokens <= self.remaining()
    }

    pub fn consume(&mut self, tokens: u64) -> Result<(), BudgetError> {
        let remaining = self.remaining();
        if tokens > remaining {
            return Err(BudgetError::Exhausted {
                requested: tokens,
                remaining,
            });
        }
        self.consumed += tokens;
        Ok(())
    }

    /// Same as [`Self::consume`] but reports failure as `false` instead of
    /// an error — used by the agent loop's per-round consumption (spec
    /// §4.4 step 3.d), which never wants budget exhaustion to propagate as
    /// an exception.
    pub fn consume_safe(&mut self, tokens: u64) -> bool {
        self.consume(tokens).is_ok()
    }

    pub fn reserve(&mut self, label: impl Into<String>, tokens: u64) -> Result<ReservationHandle, BudgetError> {
        let label = label.into();
        if self.reservations.contains_key(&label) {
            return Err(BudgetError::ReservationExists(label));
        }
        let remaining = self.remaining();
        if tokens > remaining {
            return Err(BudgetError::Exhausted {
                requested: tokens,
                remaining,
            });
        }
        self.reservations.insert(
            label.clone(),
            Reservation {
                allocated: tokens,
                consumed: 0,
            },
        );
        Ok(ReservationHandle {
            label,
            allocated: tokens,
        })
    }

    /// Equivalent to `Reservation.consume(n)` in the original: consumes
    /// against the reservation's own envelope, not the manager's global
    /// pool directly.
    pub fn reservation_consume(
        &mut self,
        handle: &ReservationHandle,
        tokens: u64,
    ) -> Result<(), BudgetError> {
        let reservation = self
            .reservations
            .get_mut(&handle.label)
            .ok_or_else(|| BudgetError::ReservationNotFound(handle.label.clone()))?;
        if tokens > reservation.remaining() {
            return Err(BudgetError::Exhausted {
                requested: tokens,
                remaining: reservation.remaining(),
            });
        }
        reservation.consumed += tokens;
        Ok(())
    }

    pub fn reservation_remaining(&self, handle: &ReservationHandle) -> Option<u64> {
        self.reservations.get(&handle.label).map(Reservation::remaining)
    }

    /// Folds the reservation's consumed tokens into the global `consumed`
    /// counter and returns the unused portion to the pool. Double-release
    /// (the label no longer present) fails with `ReservationNotFound`.
    pub fn release(&mut self, handle: ReservationHandle) -> Result<u64, BudgetError> {
        let reservation = self
            .reservations
            .remove(&handle.label)
            .ok_or(BudgetError::ReservationNotFound(handle.label))?;
        self.consumed += reservation.consumed;
        let returned = reservation.remaining();
        tracing::debug!(
            label = %handle.label,
            allocated = reservation.allocated,
            consumed = reservation.consumed,
            returned,
            "budget_reservation_released"
        );
        Ok(returned)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            total: self.total,
            consumed: self.consumed,
            remaining: self.remaining(),
            hard_remaining: self.hard_remaining(),
            reservations: self
                .reservations
                .iter()
                .map(|(label, r)| {
                    (
                        label.clone(),
                        ReservationSnapshot {
                            allocated: r.allocated,
                            consumed: r.consumed,
                            remaining: r.remaining(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_at_exactly_remaining_succeeds_one_more_fails() {
        let mut b = BudgetManager::new(1000);
        b.consume(1000).unwrap();
        assert_eq!(b.remaining(), 0);

        let mut b2 = BudgetManager::new(1000);
        assert!(b2.consume(1001).is_err());
    }

    #[test]
    fn consume_safe_never_panics_on_exhaustion() {
        let mut b = BudgetManager::new(10);
        assert!(!b.consume_safe(11));
        assert_eq!(b.consumed(), 0);
        assert!(b.consume_safe(10));
        assert_eq!(b.consumed(), 10);
    }

    #[test]
    fn reserve_subtracts_from_remaining_immediately() {
        let mut b = BudgetManager::new(1000);
        let handle = b.reserve("delegate_1", 400).unwrap();
        assert_eq!(b.remaining(), 600);
        assert_eq!(b.hard_remaining(), 1000);
        assert_eq!(handle.allocated, 400);
    }

    #[test]
    fn duplicate_reservation_label_errors() {
        let mut b = BudgetManager::new(1000);
        b.reserve("dup", 100).unwrap();
        let err = b.reserve("dup", 100).unwrap_err();
        assert_eq!(err, BudgetError::ReservationExists("dup".to_string()));
    }

    #[test]
    fn release_with_zero_consumed_is_a_no_op() {
        let mut b = BudgetManager::new(1000);
        let handle = b.reserve("noop", 250).unwrap();
        let before = b.remaining();
        let returned = b.release(handle).unwrap();
        assert_eq!(returned, 250);
        assert_eq!(b.remaining(), before + 250);
        assert_eq!(b.consumed(), 0);
    }

    #[test]
    fn release_folds_consumed_portion_into_global_consumed() {
        let mut b = BudgetManager::new(1000);
        let handle = b.reserve("partial", 500).unwrap();
        b.reservation_consume(&handle, 300).unwrap();
        let returned = b.release(handle).unwrap();
        assert_eq!(returned, 200);
        assert_eq!(b.consumed(), 300);
    }

    #[test]
    fn double_release_fails_with_reservation_error() {
        let mut b = BudgetManager::new(1000);
        let handle = b.reserve("once", 100).unwrap();
        let handle2 = handle.clone();
        b.release(handle).unwrap();
        let err = b.release(handle2).unwrap_err();
        assert_eq!(err, BudgetError::ReservationNotFound("once".to_string()));
    }

    #[test]
    fn reservation_consume_over_cap_fails() {
        let mut b = BudgetManager::new(1000);
        let handle = b.reserve("cap", 100).unwrap();
        let err = b.reservation_consume(&handle, 101).unwrap_err();
        assert!(matches!(err, BudgetError::Exhausted { requested: 101, remaining: 100 }));
    }

    #[test]
    fn invariant_consumed_plus_reservations_never_exceeds_total() {
        let mut b = BudgetManager::new(1000);
        let h1 = b.reserve("a", 300).unwrap();
        let h2 = b.reserve("b", 400).unwrap();
        b.consume(100).unwrap();
        let reserved_remaining: u64 = [&h1, &h2]
            .iter()
            .map(|h| b.reservation_remaining(h).unwrap())
            .sum();
        assert!(b.consumed() + reserved_remaining <= b.total());
    }

    #[test]
    fn profile_defaults_match_spec_table() {
        use runfabric_types::AgentProfile::*;
        assert_eq!(BudgetManager::for_profile(Reactive).total(), 8_000);
        assert_eq!(BudgetManager::for_profile(Balanced).total(), 30_000);
        assert_eq!(BudgetManager::for_profile(Pro).total(), 80_000);
        assert_eq!(BudgetManager::for_profile(Exec).total(), 200_000);
    }
}
