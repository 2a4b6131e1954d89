//! Per-file version vectors.
//!
//! Every file row carries a two-component vector `(local, remote)`: the
//! number of times each side of a tree pair has produced a new version of
//! that path. Comparing two vectors classifies the causal relationship and
//! drives reconciliation: a dominating side wins, concurrent edits are a
//! conflict.

use serde::{Deserialize, Serialize};

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VClockOrder {
    /// Both vectors are identical; nothing to do.
    Equal,
    /// The left vector strictly dominates the right.
    Dominates,
    /// The right vector strictly dominates the left.
    Dominated,
    /// Neither dominates: concurrent edits, a conflict.
    Concurrent,
}

/// A two-component version vector for one file in one tree pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VClock {
    /// Versions produced by the side that owns this row.
    pub local: i64,
    /// Highest version observed from the paired remote tree.
    pub remote: i64,
}

impl VClock {
    /// Construct from stored columns.
    pub fn new(local: i64, remote: i64) -> Self {
        Self { local, remote }
    }

    /// A fresh local edit: bump the local component.
    pub fn bump_local(&mut self) {
        self.local += 1;
    }

    /// Record that the remote side's version has been adopted.
    ///
    /// Used after a reconciliation where the remote won: our remote
    /// component catches up to what the remote produced.
    pub fn adopt_remote(&mut self, remote: i64) {
        if remote > self.remote {
            self.remote = remote;
        }
    }

    /// Compare against the same path's vector as seen by the remote tree.
    ///
    /// The remote row stores its own `(local, remote)` relative to itself,
    /// so its components are swapped before comparison: its `local` counts
    /// against our `remote` and vice versa.
    pub fn compare(&self, other: &VClock) -> VClockOrder {
        let ours = (self.local, self.remote);
        let theirs = (other.remote, other.local);

        if ours == theirs {
            return VClockOrder::Equal;
        }
        let ge = ours.0 >= theirs.0 && ours.1 >= theirs.1;
        let le = ours.0 <= theirs.0 && ours.1 <= theirs.1;
        match (ge, le) {
            (true, false) => VClockOrder::Dominates,
            (false, true) => VClockOrder::Dominated,
            _ => VClockOrder::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_rows_are_equal() {
        let a = VClock::default();
        let b = VClock::default();
        assert_eq!(a.compare(&b), VClockOrder::Equal);
    }

    #[test]
    fn local_edit_dominates_untouched_remote() {
        let mut a = VClock::default();
        a.bump_local();
        let b = VClock::default();
        assert_eq!(a.compare(&b), VClockOrder::Dominates);
        assert_eq!(b.compare(&a), VClockOrder::Dominated);
    }

    #[test]
    fn remote_adoption_restores_equality() {
        // Remote made one edit, we adopted it.
        let remote = VClock::new(1, 0);
        let mut local = VClock::default();
        local.adopt_remote(remote.local);
        assert_eq!(local.compare(&remote), VClockOrder::Equal);
    }

    #[test]
    fn divergent_edits_are_concurrent() {
        // Both sides edited since the last exchange.
        let a = VClock::new(2, 0);
        let b = VClock::new(1, 1);
        assert_eq!(a.compare(&b), VClockOrder::Concurrent);
        assert_eq!(b.compare(&a), VClockOrder::Concurrent);
    }

    #[test]
    fn chain_of_adoptions_keeps_dominance() {
        // We edited twice, remote saw the first edit only.
        let a = VClock::new(2, 0);
        let b = VClock::new(0, 1);
        assert_eq!(a.compare(&b), VClockOrder::Dominates);
    }

    #[test]
    fn adopt_remote_never_regresses() {
        let mut v = VClock::new(0, 5);
        v.adopt_remote(3);
        assert_eq!(v.remote, 5);
        v.adopt_remote(7);
        assert_eq!(v.remote, 7);
    }
}
