// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Capacity admission for instance creation.
//!
//! A semaphore holds the remaining headroom under the instance ceiling.
//! Reconcile passes feed in the engine-observed count and the pool is
//! re-targeted around it. Shrinking the ceiling below what is already
//! running never blocks: the surplus is carried as a shortfall and eaten
//! as in-flight work settles, so running builds always finish.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Every slot under the current ceiling is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {0} instance slots are in use; retry after the next reconcile")]
pub struct CapacityExceeded(pub usize);

/// Point-in-time view of the pool, for status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionState {
    pub desired_max: usize,
    pub observed: usize,
    pub available: usize,
    pub outstanding: usize,
    pub shortfall: usize,
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

struct PoolState {
    desired_max: usize,
    observed: usize,
    /// Tickets handed out and not yet settled.
    outstanding: usize,
    /// Permits a shrink could not reclaim because nothing was available.
    shortfall: usize,
}

impl AdmissionController {
    pub fn new(desired_max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(desired_max)),
                state: Mutex::new(PoolState {
                    desired_max,
                    observed: 0,
                    outstanding: 0,
                    shortfall: 0,
                }),
            }),
        }
    }

    /// Re-targets the pool: `observed` instances exist on the engine and
    /// the ceiling is `desired_max`. Headroom is adjusted so that
    /// `available + outstanding` equals `desired_max - observed`.
    pub fn resize(&self, desired_max: usize, observed: usize) {
        let mut state = self.inner.state.lock();
        state.desired_max = desired_max;
        state.observed = observed;
        state.shortfall = 0;
        let target = desired_max.saturating_sub(observed);
        let current = self.inner.permits.available_permits() + state.outstanding;
        if current < target {
            self.inner.permits.add_permits(target - current);
        } else if current > target {
            let mut excess = current - target;
            while excess > 0 {
                match Arc::clone(&self.inner.permits).try_acquire_owned() {
                    Ok(permit) => {
                        permit.forget();
                        excess -= 1;
                    }
                    Err(_) => break,
                }
            }
            state.shortfall = excess;
            if excess > 0 {
                debug!(
                    "Ceiling shrink leaves {} slots to reclaim as in-flight work settles",
                    excess
                );
            }
        }
    }

    /// Claims one slot. Commit the ticket once the instance is registered;
    /// dropping it uncommitted returns the slot.
    pub fn try_admit(&self) -> Result<AdmissionTicket, CapacityExceeded> {
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => {
                self.inner.state.lock().outstanding += 1;
                Ok(AdmissionTicket {
                    permit: Some(permit),
                    pool: Arc::clone(&self.inner),
                })
            }
            Err(_) => Err(CapacityExceeded(self.inner.state.lock().desired_max)),
        }
    }

    pub fn state(&self) -> AdmissionState {
        let state = self.inner.state.lock();
        AdmissionState {
            desired_max: state.desired_max,
            observed: state.observed,
            available: self.inner.permits.available_permits(),
            outstanding: state.outstanding,
            shortfall: state.shortfall,
        }
    }
}

impl Inner {
    /// Runs exactly once per ticket. A committed ticket keeps its permit
    /// consumed; the instance it stands for is counted by the next resize.
    /// An abandoned ticket's slot comes back, less any shrink shortfall.
    fn settle(&self, committed: bool) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if !committed {
            if state.shortfall > 0 {
                state.shortfall -= 1;
            } else {
                self.permits.add_permits(1);
            }
        }
    }
}

/// A claimed capacity slot, alive until committed or dropped.
pub struct AdmissionTicket {
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<Inner>,
}

impl AdmissionTicket {
    pub fn commit(mut self) {
        if let Some(permit) = self.permit.take() {
            permit.forget();
            self.pool.settle(true);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.forget();
            self.pool.settle(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── resize ──────────────────────────────────────────────────────────

    #[test]
    fn shrinks_headroom_when_observed_exceeds_the_ceiling() {
        let pool = AdmissionController::new(9);
        pool.resize(5, 10);
        assert_eq!(pool.state().available, 0);
        assert_eq!(pool.state().shortfall, 0);
    }

    #[test]
    fn reclaims_surplus_headroom() {
        let pool = AdmissionController::new(11);
        pool.resize(15, 10);
        assert_eq!(pool.state().available, 5);
    }

    #[test]
    fn grows_headroom_up_to_the_target() {
        let pool = AdmissionController::new(1);
        pool.resize(15, 10);
        assert_eq!(pool.state().available, 5);
    }

    #[test]
    fn resize_to_the_same_target_is_a_no_op() {
        let pool = AdmissionController::new(5);
        pool.resize(8, 3);
        pool.resize(8, 3);
        assert_eq!(pool.state().available, 5);
    }

    // ── admission tickets ───────────────────────────────────────────────

    #[test]
    fn exhausted_pool_rejects_with_the_ceiling_in_the_message() {
        let pool = AdmissionController::new(1);
        let _held = pool.try_admit().unwrap();
        let err = pool.try_admit().unwrap_err();
        assert_eq!(err, CapacityExceeded(1));
        assert_eq!(
            err.to_string(),
            "all 1 instance slots are in use; retry after the next reconcile"
        );
    }

    #[test]
    fn dropping_an_uncommitted_ticket_returns_the_slot() {
        let pool = AdmissionController::new(2);
        let ticket = pool.try_admit().unwrap();
        assert_eq!(pool.state().available, 1);
        assert_eq!(pool.state().outstanding, 1);
        drop(ticket);
        assert_eq!(pool.state().available, 2);
        assert_eq!(pool.state().outstanding, 0);
    }

    #[test]
    fn committing_keeps_the_slot_consumed_until_the_next_resize() {
        let pool = AdmissionController::new(2);
        let ticket = pool.try_admit().unwrap();
        ticket.commit();
        assert_eq!(pool.state().available, 1);
        assert_eq!(pool.state().outstanding, 0);
        // The committed instance shows up in the next observation.
        pool.resize(2, 1);
        assert_eq!(pool.state().available, 1);
    }

    // ── shrink under load ───────────────────────────────────────────────

    #[test]
    fn shrink_below_outstanding_work_never_blocks() {
        let pool = AdmissionController::new(2);
        let first = pool.try_admit().unwrap();
        let second = pool.try_admit().unwrap();

        pool.resize(1, 0);
        assert_eq!(pool.state().available, 0);
        assert_eq!(pool.state().shortfall, 1);

        // The first abandoned slot is swallowed by the shortfall.
        drop(first);
        assert_eq!(pool.state().available, 0);
        assert_eq!(pool.state().shortfall, 0);

        // The second comes back as real headroom.
        drop(second);
        assert_eq!(pool.state().available, 1);
    }
}
