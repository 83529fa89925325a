//! Holds the current aggregate. Readers get a shared immutable snapshot;
//! a replacement never changes a snapshot someone already holds.

use std::sync::{Arc, PoisonError, RwLock};

use crate::aggregate::AggregateState;

#[derive(Default)]
pub struct StateStore {
    current: RwLock<Arc<AggregateState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Arc<AggregateState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, state: AggregateState) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_loading() {
        assert!(StateStore::new().get().is_loading);
    }

    #[test]
    fn held_snapshot_is_unaffected_by_replace() {
        let store = StateStore::new();
        let before = store.get();

        store.replace(AggregateState {
            is_loading: false,
            ..AggregateState::default()
        });

        assert!(before.is_loading);
        assert!(!store.get().is_loading);
    }
}
