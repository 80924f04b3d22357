use std::sync::atomic::{AtomicU64, Ordering};

/// Bits below this shift hold the originating replica index; bits at or
/// above it hold the monotonic counter.
const VALUE_SHIFT: u32 = 8;

pub fn ballot_value(ballot: u64) -> u64 {
    ballot >> VALUE_SHIFT
}

pub fn ballot_replica(ballot: u64) -> u8 {
    (ballot & 0xFF) as u8
}

pub fn make_ballot(value: u64, replica_index: u8) -> u64 {
    (value << VALUE_SHIFT) | replica_index as u64
}

/// The current local ballot, updated monotonically from observed peer
/// ballots per §4.2.10: on overflow the counter resets to `1`, never to
/// `0`, so a post-reset ballot stays distinguishable from a stale one
/// encoding the same replica index.
pub struct AtomicBallot {
    value: AtomicU64,
}

impl AtomicBallot {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    pub fn load(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Folds an observed ballot (from a peer message, or a seed value
    /// from the persisted log) into the local ballot, returning the
    /// resulting local ballot.
    pub fn update(&self, observed: u64, my_index: u8) -> u64 {
        let observed_value = ballot_value(observed);
        let (next_value, overflowed) = observed_value.overflowing_add(1);
        if overflowed {
            let reset = make_ballot(1, my_index);
            self.value.store(reset, Ordering::SeqCst);
            return reset;
        }

        let candidate = make_ballot(next_value, my_index);
        loop {
            let current = self.value.load(Ordering::SeqCst);
            if candidate <= current {
                return current;
            }
            if self
                .value
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_never_decreases() {
        let ballot = AtomicBallot::new(make_ballot(5, 0));
        ballot.update(make_ballot(10, 1), 0);
        let after = ballot.load();
        ballot.update(make_ballot(1, 2), 0);
        assert_eq!(ballot.load(), after, "a lower observed ballot must not move the local one backward");
    }

    #[test]
    fn update_advances_strictly() {
        let ballot = AtomicBallot::new(make_ballot(5, 0));
        let updated = ballot.update(make_ballot(5, 1), 0);
        assert_eq!(ballot_value(updated), 6);
    }

    #[test]
    fn overflow_resets_without_reaching_zero() {
        let ballot = AtomicBallot::new(0);
        let updated = ballot.update(make_ballot(u64::MAX >> VALUE_SHIFT, 3), 2);
        assert_eq!(ballot_value(updated), 1);
        assert_eq!(ballot_replica(updated), 2);
    }
}
