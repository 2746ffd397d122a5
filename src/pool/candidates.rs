use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::models::{NodeDescriptor, NodeKey};

/// Pick up to `budget` node indices spread evenly over `nodes`
///
/// A stride sample keeps a long run of dead entries at the head of a
/// subscription from eating the whole budget. Nodes whose key is in
/// `exclude` are skipped; if the stride cannot fill the budget the rest is
/// filled in list order.
pub fn spread_sample(
    nodes: &[Arc<NodeDescriptor>],
    budget: usize,
    exclude: &HashSet<NodeKey>,
) -> Vec<Arc<NodeDescriptor>> {
    let n = nodes.len();
    let take = budget.min(n);
    if take == 0 {
        return Vec::new();
    }

    let mut picked = Vec::with_capacity(take);
    let mut seen = HashSet::with_capacity(take);

    let mut consider = |node: &Arc<NodeDescriptor>, picked: &mut Vec<Arc<NodeDescriptor>>| {
        let key = node.identity_key();
        if !exclude.contains(&key) && seen.insert(key) {
            picked.push(node.clone());
        }
    };

    for i in 0..take {
        consider(&nodes[i * n / take], &mut picked);
    }
    for node in nodes {
        if picked.len() >= take {
            break;
        }
        consider(node, &mut picked);
    }

    picked.truncate(take);
    picked
}

/// Candidates waiting for bring-up
#[derive(Debug, Default)]
pub struct CandidateQueue {
    queue: VecDeque<Arc<NodeDescriptor>>,
}

impl CandidateQueue {
    /// Replace the queue with a fresh sample of `nodes`
    pub fn rebuild(
        &mut self,
        nodes: &[Arc<NodeDescriptor>],
        budget: usize,
        exclude: &HashSet<NodeKey>,
    ) {
        self.queue = spread_sample(nodes, budget, exclude).into();
    }

    pub fn pop(&mut self) -> Option<Arc<NodeDescriptor>> {
        self.queue.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
