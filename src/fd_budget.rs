//! File-descriptor budget: a semaphore sized from the process's socket
//! rlimit minus a reserve, so the accept/dial paths back off before
//! `EMFILE` starts failing unrelated syscalls across the process (§5).
//!
//! Grounded on the original implementation's `set_max_file_descriptors`
//! (raise `RLIMIT_NOFILE` to its hard max, then keep `ULIMIT_BUFFER` spare
//! descriptors beyond whatever connection limit that yields); reimplemented
//! here as a `tokio::sync::Semaphore` permit per live socket rather than a
//! manually-tracked counter.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FdBudgetError {
    #[error("failed to read file descriptor rlimit: {0}")]
    Rlimit(#[from] std::io::Error),

    #[error("rlimit soft cap ({soft}) leaves no room for {reserved} reserved descriptors")]
    TooFewDescriptors { soft: u64, reserved: u64 },
}

/// Tracks how many sockets the process may have open at once, reserving
/// `reserved_fds` for listeners, log files, and anything else outside the
/// connection pool.
pub struct FdBudget {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl FdBudget {
    /// Raise the soft `RLIMIT_NOFILE` to the hard max where possible, then
    /// build a budget with `capacity = soft_limit - reserved_fds`.
    pub fn from_rlimit(reserved_fds: u64) -> Result<Self, FdBudgetError> {
        let (soft, hard) = rlimit::Resource::NOFILE.get()?;
        if hard > soft {
            if let Err(e) = rlimit::Resource::NOFILE.set(hard, hard) {
                warn!(error = %e, "could not raise RLIMIT_NOFILE to hard max");
            } else {
                info!(from = soft, to = hard, "raised RLIMIT_NOFILE");
            }
        }
        let (soft, _) = rlimit::Resource::NOFILE.get()?;
        if soft <= reserved_fds {
            return Err(FdBudgetError::TooFewDescriptors {
                soft,
                reserved: reserved_fds,
            });
        }
        Ok(Self::with_capacity((soft - reserved_fds) as usize))
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire one descriptor's worth of budget, blocking the caller (the
    /// accept loop or a dial attempt) until one frees up.
    pub async fn acquire(&self) -> FdPermit<'_> {
        FdPermit(
            self.semaphore
                .acquire()
                .await
                .expect("FdBudget semaphore is never closed"),
        )
    }

    /// Non-blocking variant for the accept loop: returns `None` immediately
    /// rather than stalling new accepts behind one slow dial.
    pub fn try_acquire(&self) -> Option<FdPermit<'_>> {
        self.semaphore.try_acquire().ok().map(FdPermit)
    }

    /// Owned variant of [`Self::try_acquire`], for permits that need to
    /// outlive the `FdBudget` reference — e.g. moved into a spawned
    /// per-connection task rather than held by the accept loop itself.
    pub fn try_acquire_owned(self: &Arc<Self>) -> Option<OwnedFdPermit> {
        self.semaphore.clone().try_acquire_owned().ok().map(OwnedFdPermit)
    }
}

/// RAII handle for one reserved descriptor. Dropping it returns the permit.
pub struct FdPermit<'a>(SemaphorePermit<'a>);

/// Like [`FdPermit`] but independent of any borrow, for permits carried
/// into a `'static` task.
pub struct OwnedFdPermit(OwnedSemaphorePermit);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_capacity_reports_full_availability() {
        let budget = FdBudget::with_capacity(4);
        assert_eq!(budget.available(), 4);
    }

    #[tokio::test]
    async fn acquire_decrements_availability_until_dropped() {
        let budget = FdBudget::with_capacity(1);
        {
            let _permit = budget.acquire().await;
            assert_eq!(budget.available(), 0);
            assert!(budget.try_acquire().is_none());
        }
        assert_eq!(budget.available(), 1);
    }

    #[test]
    fn owned_permit_outlives_the_budget_reference() {
        let budget = Arc::new(FdBudget::with_capacity(1));
        let permit = budget.try_acquire_owned().unwrap();
        assert_eq!(budget.available(), 0);
        drop(budget);
        drop(permit);
    }
}
