use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Maximum number of polls a spin-wait may take before giving up.
///
/// Production waits pass `None` and spin until the condition holds, tests pass a budget so a
/// broken peer turns into an error instead of a hung test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinBudget(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("spin budget exhausted after {spins} polls")]
pub struct SpinTimeout {
    pub spins: u64,
}

/// Poll `condition` until it returns true.
///
/// Returns the number of unsuccessful polls.
pub fn spin_until(
    mut condition: impl FnMut() -> bool,
    budget: Option<SpinBudget>,
) -> Result<u64, SpinTimeout> {
    let mut spins = 0;
    while !condition() {
        if let Some(SpinBudget(max)) = budget {
            if spins >= max {
                return Err(SpinTimeout { spins });
            }
        }
        spins += 1;
        spin_loop();
    }
    Ok(spins)
}

/// One-shot flag, set by one thread and spun on by others.
#[derive(Debug, Clone, Default)]
pub struct ReadyFlag {
    ready: Arc<AtomicBool>,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn wait(&self, budget: Option<SpinBudget>) -> Result<u64, SpinTimeout> {
        spin_until(|| self.is_set(), budget)
    }
}
