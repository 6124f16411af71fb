use crate::prelude::AgentIdx;

/// Queue delta magnitudes carried by events. The sign picks the
/// direction: positive enters the queue, negative leaves it.
pub mod queue_values {
    /// No queue movement.
    pub const NO_ONE: i32 = 0;
    /// Only the target agent.
    pub const ONLY_SELF: i32 = 1;
    /// The target agent and its whole neighborhood.
    pub const EVERYONE: i32 = 2;
}

/// Per-step work filter: an agent is scanned only while its counter is
/// positive, i.e. while it or a neighbor carries a virus. Updates buffer
/// into `active_next` during the apply phase and fold into `active` on
/// refresh, so deltas never become visible mid-step.
#[derive(Debug, Clone, Default)]
pub struct ActiveQueue {
    active: Vec<i64>,
    active_next: Vec<i64>,
}

impl ActiveQueue {
    pub fn resize(&mut self, n: usize) {
        self.active.clear();
        self.active.resize(n, 0);
        self.active_next.clear();
        self.active_next.resize(n, 0);
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Committed counter of agent `i`.
    pub fn get(&self, i: AgentIdx) -> i64 {
        self.active[i]
    }

    pub fn is_active(&self, i: AgentIdx) -> bool {
        self.active[i] > 0
    }

    /// Buffer +1 for `agent` and, when `everyone`, for each neighbor.
    pub fn add(&mut self, agent: AgentIdx, neighbors: &[AgentIdx], everyone: bool) {
        self.active_next[agent] += 1;
        if everyone {
            for &n in neighbors {
                self.active_next[n] += 1;
            }
        }
    }

    /// Buffer -1 for `agent` and, when `everyone`, for each neighbor.
    pub fn sub(&mut self, agent: AgentIdx, neighbors: &[AgentIdx], everyone: bool) {
        self.active_next[agent] -= 1;
        if everyone {
            for &n in neighbors {
                self.active_next[n] -= 1;
            }
        }
    }

    /// Fold buffered deltas into the committed counters. Counters clamp
    /// at zero: rewiring may retarget a neighborhood between an enter and
    /// its matching leave. `strict` (models without rewiring) asserts the
    /// invariant in debug builds instead.
    pub fn flush(&mut self, strict: bool) {
        for (a, nx) in self.active.iter_mut().zip(self.active_next.iter_mut()) {
            *a += *nx;
            *nx = 0;
            if strict {
                debug_assert!(*a >= 0, "active-set counter went negative");
            }
            if *a < 0 {
                *a = 0;
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_invisible_until_flush() {
        let mut q = ActiveQueue::default();
        q.resize(4);
        q.add(0, &[1, 2], true);
        assert!(!q.is_active(0));
        q.flush(true);
        assert!(q.is_active(0));
        assert!(q.is_active(1));
        assert!(q.is_active(2));
        assert!(!q.is_active(3));
    }

    #[test]
    fn symmetric_add_sub_cancels() {
        let mut q = ActiveQueue::default();
        q.resize(3);
        q.add(1, &[0, 2], true);
        q.flush(true);
        q.sub(1, &[0, 2], true);
        q.flush(true);
        for i in 0..3 {
            assert_eq!(q.get(i), 0, "agent {}", i);
        }
    }

    #[test]
    fn only_self_leaves_neighbors_alone() {
        let mut q = ActiveQueue::default();
        q.resize(3);
        q.add(1, &[0, 2], false);
        q.flush(true);
        assert_eq!(q.get(0), 0);
        assert_eq!(q.get(1), 1);
        assert_eq!(q.get(2), 0);
    }

    #[test]
    fn flush_clamps_at_zero() {
        let mut q = ActiveQueue::default();
        q.resize(1);
        q.sub(0, &[], false);
        q.flush(false);
        assert_eq!(q.get(0), 0);
    }
}
