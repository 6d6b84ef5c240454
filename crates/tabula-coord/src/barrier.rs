//! Per-cycle completion barrier.

use tabula_core::TabulaError;

use crate::protocol::{Completion, Signal};

/// What [`FrameState::record`] did with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Counted,
    /// Answers a different cycle, or is not a frame completion at all.
    Stale,
    /// Second completion from the same worker in this cycle.
    Duplicate,
    UnknownWorker,
}

#[derive(Debug)]
struct Slot {
    seen: bool,
    generation: Option<u64>,
    failure: Option<String>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            seen: false,
            generation: None,
            failure: None,
        }
    }
}

/// Completion bookkeeping for the current cycle.
///
/// Ready exactly when every worker has reported once for this cycle, whether it
/// succeeded or not.
#[derive(Debug)]
pub struct FrameState {
    cycle: u64,
    completed: usize,
    slots: Vec<Slot>,
}

impl FrameState {
    pub fn new(worker_count: usize) -> Self {
        Self {
            cycle: 0,
            completed: 0,
            slots: (0..worker_count).map(|_| Slot::empty()).collect(),
        }
    }

    /// Open the barrier for `cycle`, forgetting everything about the previous one.
    pub fn reset(&mut self, cycle: u64) {
        self.cycle = cycle;
        self.completed = 0;
        for slot in &mut self.slots {
            *slot = Slot::empty();
        }
    }

    pub fn record(&mut self, completion: &Completion) -> Recorded {
        if completion.signal != Signal::Frame(self.cycle) {
            return Recorded::Stale;
        }
        let Some(slot) = self.slots.get_mut(completion.worker) else {
            return Recorded::UnknownWorker;
        };
        if slot.seen {
            return Recorded::Duplicate;
        }

        slot.seen = true;
        match &completion.outcome {
            Ok(generation) => slot.generation = *generation,
            Err(e) => slot.failure = Some(e.to_string()),
        }
        self.completed += 1;
        Recorded::Counted
    }

    pub fn is_ready(&self) -> bool {
        self.completed == self.slots.len()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Generation the worker reported for its artifact in this cycle.
    pub fn generation(&self, worker: usize) -> Option<u64> {
        self.slots.get(worker).and_then(|slot| slot.generation)
    }

    /// The lowest-indexed worker failure in this cycle.
    pub fn first_failure(&self) -> Option<(usize, &str)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(worker, slot)| slot.failure.as_deref().map(|message| (worker, message)))
    }

    pub fn timeout_error(&self) -> TabulaError {
        TabulaError::BarrierTimeout {
            cycle: self.cycle,
            completed: self.completed,
            expected: self.slots.len(),
        }
    }
}
