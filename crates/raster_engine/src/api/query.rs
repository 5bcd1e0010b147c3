//! Query contract

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Supported query kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Samples that passed the depth/stencil tests
    Occlusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Idle,
    Active,
    Finished,
}

/// A counter with a start/add/finish lifecycle.
///
/// Draws hold references to attached queries, start them at draw start,
/// accumulate per-cluster contributions at draw end, and finish them.
#[derive(Debug)]
pub struct Query {
    ty: QueryType,
    value: AtomicU64,
    state: Mutex<QueryState>,
}

impl Query {
    /// Creates an idle query of the given type
    pub fn new(ty: QueryType) -> Self {
        Self {
            ty,
            value: AtomicU64::new(0),
            state: Mutex::new(QueryState::Idle),
        }
    }

    /// The query's kind
    pub fn query_type(&self) -> QueryType {
        self.ty
    }

    /// Begins accumulation, clearing any previous value
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != QueryState::Active {
            self.value.store(0, Ordering::Relaxed);
        }
        *state = QueryState::Active;
    }

    /// Adds a contribution; callable from any worker
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Ends accumulation
    pub fn finish(&self) {
        *self.state.lock().unwrap() = QueryState::Finished;
    }

    /// The accumulated value; meaningful once finished
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Whether the query has finished accumulating
    pub fn is_finished(&self) -> bool {
        *self.state.lock().unwrap() == QueryState::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_lifecycle() {
        let query = Query::new(QueryType::Occlusion);
        query.start();
        query.add(5);
        query.add(4);
        query.finish();
        assert!(query.is_finished());
        assert_eq!(query.value(), 9);

        // Restarting clears the previous accumulation.
        query.start();
        query.finish();
        assert_eq!(query.value(), 0);
    }
}
