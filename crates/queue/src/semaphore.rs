// SPDX-License-Identifier: Apache-2.0

//! User-declared counting semaphores and the waiting tier.
//!
//! A pip may declare named counting-semaphore requirements. Acquisition is
//! all-or-nothing: either every requirement is granted and the pip proceeds
//! to its dispatch queue, or the pip waits in the tier until releases make
//! all of its requirements satisfiable at once.

use buildflow_graph::SemaphoreRequirement;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct SemaphoreState {
    limit: u32,
    acquired: u32,
}

/// Registry of named counting semaphores.
#[derive(Debug, Default)]
pub(crate) struct SemaphoreRegistry {
    semaphores: HashMap<String, SemaphoreState>,
}

impl SemaphoreRegistry {
    /// Whether all of `requirements` could be acquired right now.
    pub(crate) fn can_acquire(&self, requirements: &[SemaphoreRequirement]) -> bool {
        requirements.iter().all(|req| {
            let limit = self
                .semaphores
                .get(&req.name)
                .map_or(req.limit, |s| s.limit.max(req.limit));
            let acquired = self.semaphores.get(&req.name).map_or(0, |s| s.acquired);
            acquired.saturating_add(req.units) <= limit
        })
    }

    /// Acquires all of `requirements`, or none. Returns whether acquisition
    /// succeeded.
    pub(crate) fn try_acquire(&mut self, requirements: &[SemaphoreRequirement]) -> bool {
        if !self.can_acquire(requirements) {
            return false;
        }
        for req in requirements {
            let state = self
                .semaphores
                .entry(req.name.clone())
                .or_insert_with(SemaphoreState::default);
            state.limit = state.limit.max(req.limit);
            state.acquired += req.units;
        }
        true
    }

    /// Releases all of `requirements`.
    pub(crate) fn release(&mut self, requirements: &[SemaphoreRequirement]) {
        for req in requirements {
            if let Some(state) = self.semaphores.get_mut(&req.name) {
                state.acquired = state.acquired.saturating_sub(req.units);
            }
        }
    }

    /// Units currently acquired for `name`.
    #[cfg(test)]
    pub(crate) fn acquired(&self, name: &str) -> u32 {
        self.semaphores.get(name).map_or(0, |s| s.acquired)
    }
}

/// An item waiting for its semaphore requirements.
pub(crate) struct TierEntry<T> {
    pub(crate) priority: i64,
    pub(crate) item: T,
    pub(crate) requirements: Vec<SemaphoreRequirement>,
}

/// Items whose semaphore requirements are currently saturated.
///
/// Kept in arrival order; on release, the longest-waiting satisfiable items
/// are re-admitted first.
pub(crate) struct SemaphoreTier<T> {
    entries: Vec<TierEntry<T>>,
}

impl<T> Default for SemaphoreTier<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> SemaphoreTier<T> {
    pub(crate) fn push(&mut self, entry: TierEntry<T>) {
        self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry that `registry` can now admit, acquiring its
    /// requirements in the process. Longest-waiting entries are tried first.
    pub(crate) fn admit_satisfiable(
        &mut self,
        registry: &mut SemaphoreRegistry,
    ) -> Vec<TierEntry<T>> {
        let mut admitted = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if registry.try_acquire(&self.entries[index].requirements) {
                admitted.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        admitted
    }

    pub(crate) fn drain(&mut self) -> Vec<TierEntry<T>> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str, units: u32, limit: u32) -> SemaphoreRequirement {
        SemaphoreRequirement {
            name: name.to_owned(),
            units,
            limit,
        }
    }

    #[test]
    fn acquisition_is_all_or_nothing() {
        let mut registry = SemaphoreRegistry::default();
        assert!(registry.try_acquire(&[req("disk", 2, 3)]));
        // "disk" has one unit left; the pair below must not partially acquire.
        assert!(!registry.try_acquire(&[req("net", 1, 4), req("disk", 2, 3)]));
        assert_eq!(registry.acquired("net"), 0);
        assert_eq!(registry.acquired("disk"), 2);
    }

    #[test]
    fn release_makes_room() {
        let mut registry = SemaphoreRegistry::default();
        let requirements = [req("disk", 3, 3)];
        assert!(registry.try_acquire(&requirements));
        assert!(!registry.try_acquire(&requirements));
        registry.release(&requirements);
        assert!(registry.try_acquire(&requirements));
    }

    #[test]
    fn tier_admits_longest_waiting_first() {
        let mut registry = SemaphoreRegistry::default();
        assert!(registry.try_acquire(&[req("disk", 3, 3)]));

        let mut tier = SemaphoreTier::default();
        tier.push(TierEntry {
            priority: 1,
            item: "older",
            requirements: vec![req("disk", 2, 3)],
        });
        tier.push(TierEntry {
            priority: 99,
            item: "newer",
            requirements: vec![req("disk", 2, 3)],
        });

        registry.release(&[req("disk", 3, 3)]);
        let admitted = tier.admit_satisfiable(&mut registry);
        // Only one fits (2 of 3 units); arrival order beats priority here.
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].item, "older");
        assert_eq!(tier.len(), 1);
    }
}
