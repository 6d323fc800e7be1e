use std::collections::{BTreeMap, BTreeSet};

use crate::common::TxnId;

/// Directed graph of transactions, `a -> b` meaning `a` waits for `b`.
///
/// Ordered maps keep cycle search deterministic: it starts from the lowest
/// transaction id and explores neighbours in ascending order.
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn remove_edge(&mut self, from: TxnId, to: TxnId) {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                self.edges.remove(&from);
            }
        }
    }

    /// Drops `txn` and every edge touching it.
    pub fn remove_node(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        self.edges.retain(|_, targets| {
            targets.remove(&txn);
            !targets.is_empty()
        });
    }

    /// All edges in ascending `(from, to)` order.
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (*from, *to)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Finds the first cycle and returns its youngest member (largest id).
    pub fn has_cycle(&self) -> Option<TxnId> {
        let mut finished = BTreeSet::new();
        for &start in self.edges.keys() {
            if finished.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.find_cycle(start, &mut path, &mut finished) {
                return cycle.into_iter().max();
            }
        }
        None
    }

    /// Depth-first search; `path` is the current stack of the walk.
    fn find_cycle(
        &self,
        node: TxnId,
        path: &mut Vec<TxnId>,
        finished: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(pos) = path.iter().position(|t| *t == node) {
            return Some(path[pos..].to_vec());
        }
        if finished.contains(&node) {
            return None;
        }
        path.push(node);
        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if let Some(cycle) = self.find_cycle(next, path, finished) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        finished.insert(node);
        None
    }
}
