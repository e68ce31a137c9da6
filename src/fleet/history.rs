//! Bounded memory of executors that reached a terminal state.

use std::collections::{HashMap, VecDeque};

use crate::fleet::executor::Executor;
use crate::types::{BuildRef, WorkerName};

#[derive(Debug)]
pub(crate) struct FinishedExecutors {
    limit: usize,
    order: VecDeque<BuildRef>,
    by_build: HashMap<BuildRef, Executor>,
}

impl FinishedExecutors {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            by_build: HashMap::new(),
        }
    }

    /// Remember a finished executor, replacing an older run of the same build.
    pub fn record(&mut self, executor: Executor) {
        if self.limit == 0 {
            return;
        }

        let build = executor.build.clone();
        if self.by_build.insert(build.clone(), executor).is_some() {
            self.order.retain(|b| b != &build);
        }
        self.order.push_back(build);

        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.by_build.remove(&oldest);
            }
        }
    }

    pub fn get(&self, build: &BuildRef) -> Option<&Executor> {
        self.by_build.get(build)
    }

    /// The most recently finished executor that held `slot` on `worker`.
    pub fn last_in_slot(&self, worker: &WorkerName, slot: u32) -> Option<&Executor> {
        self.order
            .iter()
            .rev()
            .filter_map(|build| self.by_build.get(build))
            .find(|e| &e.worker == worker && e.slot == slot)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_build.len()
    }
}
