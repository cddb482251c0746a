//! Fitness policy for rebalancing two adjacent pages during delete.

/// Scores a candidate redistribution of records between a left and a right
/// page. The caller evaluates every candidate split point and keeps the one
/// with the highest score.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Prefer filling the left page.
    LeftBias,
    /// Prefer filling the right page.
    RightBias,
    /// Prefer even distribution.
    EvenBias,
}

impl JoinPolicy {
    /// Fitness of a candidate where the left page would hold `left_size`
    /// bytes and the right page `right_size`, each page holding at most
    /// `capacity`. A candidate that overflows either page scores `0`.
    pub fn rebalance_fit(&self, left_size: usize, right_size: usize, capacity: usize) -> usize {
        if left_size > capacity || right_size > capacity {
            return 0;
        }
        match self {
            JoinPolicy::LeftBias => left_size,
            JoinPolicy::RightBias => right_size,
            JoinPolicy::EvenBias => capacity - left_size.abs_diff(right_size),
        }
    }
}
