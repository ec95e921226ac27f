use std::collections::BTreeMap;

/// Puts results that complete out of order back into submission order.
///
/// Every input gets a sequence number; a completed result is held until every
/// lower sequence number has been released.
#[derive(Debug)]
pub struct Resequencer<T> {
    next_expected: u64,
    held: BTreeMap<u64, T>,
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self {
            next_expected: 0,
            held: BTreeMap::new(),
        }
    }
}

impl<T> Resequencer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completion and return every result that is now in order
    pub fn complete(&mut self, sequence: u64, result: T) -> Vec<T> {
        if sequence < self.next_expected {
            // already released; sequence numbers are never reused
            return Vec::new();
        }
        self.held.insert(sequence, result);

        let mut ready = Vec::new();
        while let Some(result) = self.held.remove(&self.next_expected) {
            ready.push(result);
            self.next_expected += 1;
        }
        ready
    }

    /// Results completed but waiting for an earlier one
    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::interleaved(vec![1, 0, 3, 2])]
    #[case::last_first(vec![3, 0, 1, 2])]
    fn test_output_follows_sequence(#[case] completion_order: Vec<u64>) {
        let mut resequencer = Resequencer::new();
        let mut released = Vec::new();
        for sequence in completion_order {
            released.extend(resequencer.complete(sequence, sequence));
        }
        assert_eq!(released, vec![0, 1, 2, 3]);
        assert_eq!(resequencer.held(), 0);
    }

    #[test]
    fn test_holds_until_gap_filled() {
        let mut resequencer = Resequencer::new();
        assert!(resequencer.complete(1, "b").is_empty());
        assert!(resequencer.complete(2, "c").is_empty());
        assert_eq!(resequencer.held(), 2);
        assert_eq!(resequencer.complete(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(resequencer.next_expected(), 3);
    }
}
