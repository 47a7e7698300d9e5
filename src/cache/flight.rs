use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::cache::tier::Tile;
use crate::error::Result;

#[derive(Clone)]
enum Phase {
    Queued,
    Running,
    Done(Result<Arc<Tile>>),
}

/// One pending tile build shared by everyone asking for the same key.
///
/// Whoever moves it from queued to running does the work; everybody else waits on it.
pub(crate) struct Flight {
    phase: Mutex<Phase>,
    done: Condvar,
    epoch: u64,
    generation: AtomicU64,
}

impl Flight {
    pub(crate) fn new(epoch: u64, generation: u64) -> Self {
        Self {
            phase: Mutex::new(Phase::Queued),
            done: Condvar::new(),
            epoch,
            generation: AtomicU64::new(generation),
        }
    }

    /// Source epoch the flight was started under.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Newest request generation still interested in this build.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn refresh(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::AcqRel);
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_claim(&self) -> bool {
        let mut phase = self.phase();
        if matches!(*phase, Phase::Queued) {
            *phase = Phase::Running;
            true
        } else {
            false
        }
    }

    /// The first result wins; later calls are ignored.
    pub(crate) fn finish(&self, result: Result<Arc<Tile>>) {
        let mut phase = self.phase();
        if !matches!(*phase, Phase::Done(_)) {
            *phase = Phase::Done(result);
            self.done.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> Result<Arc<Tile>> {
        let mut phase = self.phase();
        loop {
            if let Phase::Done(result) = &*phase {
                return result.clone();
            }
            phase = self
                .done
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `None` when the deadline passes first.
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Result<Arc<Tile>>> {
        let mut phase = self.phase();
        loop {
            if let Phase::Done(result) = &*phase {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            phase = self
                .done
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn only_one_claimant() {
        let flight = Flight::new(0, 0);
        assert!(flight.try_claim());
        assert!(!flight.try_claim());
    }

    #[test]
    fn waiters_see_the_first_result() {
        let flight = Arc::new(Flight::new(0, 0));
        let waiter = {
            let flight = flight.clone();
            thread::spawn(move || flight.wait())
        };
        assert!(flight
            .wait_until(Instant::now() + Duration::from_millis(5))
            .is_none());
        flight.finish(Err(EngineError::BuildCancelled));
        flight.finish(Err(EngineError::InvalidPointBudget));
        assert_eq!(waiter.join().unwrap().unwrap_err(), EngineError::BuildCancelled);
    }

    #[test]
    fn refresh_only_moves_forward() {
        let flight = Flight::new(0, 3);
        flight.refresh(1);
        assert_eq!(flight.generation(), 3);
        flight.refresh(5);
        assert_eq!(flight.generation(), 5);
    }
}
