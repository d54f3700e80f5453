use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Position of each active key in the tracked order.
pub type ActiveIndex = HashMap<String, usize>;

/// Remembers the order in which keys became active so repeated polls do not
/// reshuffle them. One instance orders sessions, another orders repos.
#[derive(Clone, Debug, Default)]
pub struct ActiveOrder {
    order: Vec<String>,
}

impl ActiveOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops keys that are no longer active, prepends newly active keys in
    /// the order given, and leaves already-tracked keys where they were.
    pub fn update<I, S>(&mut self, active_ids: I) -> ActiveIndex
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut currently_active: Vec<String> = Vec::new();
        for id in active_ids {
            let id = id.into();
            if seen.insert(id.clone()) {
                currently_active.push(id);
            }
        }

        self.order.retain(|id| seen.contains(id));

        let tracked: HashSet<&String> = self.order.iter().collect();
        let newly_active: Vec<String> = currently_active
            .into_iter()
            .filter(|id| !tracked.contains(id))
            .collect();

        let mut next = newly_active;
        next.append(&mut self.order);
        self.order = next;

        self.index()
    }

    pub fn index(&self) -> ActiveIndex {
        self.order
            .iter()
            .enumerate()
            .map(|(position, id)| (id.clone(), position))
            .collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

/// Active keys first in tracked order, then inactive keys newest first.
pub fn active_first_compare(
    index: &ActiveIndex,
    a_key: &str,
    a_timestamp: i64,
    b_key: &str,
    b_timestamp: i64,
) -> Ordering {
    match (index.get(a_key), index.get(b_key)) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b_timestamp.cmp(&a_timestamp),
    }
}
