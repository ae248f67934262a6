//! Identifier allocation over an atomic per-entity counter
use crate::model::Entity;
use anyhow::Context;
use sled::Tree;

#[derive(Clone)]
pub struct IdAllocator {
    counters: Tree,
}

impl IdAllocator {
    pub fn new(counters: Tree) -> Self {
        Self { counters }
    }

    /// Issue one id, e.g. `REQI42`.
    pub fn allocate(&self, entity: Entity) -> anyhow::Result<String> {
        self.allocate_batch(entity, 1)?
            .into_iter()
            .next()
            .context("counter returned an empty batch")
    }

    /// Reserve `count` consecutive ids in one atomic counter step.
    pub fn allocate_batch(&self, entity: Entity, count: usize) -> anyhow::Result<Vec<String>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let step = count as u64;

        // update_and_fetch retries the closure on contention, so the counter
        // never hands the same range to two callers.
        let last = self
            .counters
            .update_and_fetch(entity.as_str(), |current| {
                let next = current.map(read_counter).unwrap_or(0).saturating_add(step);
                Some(next.to_be_bytes().to_vec())
            })?
            .map(|bytes| read_counter(&bytes))
            .context("counter update produced no value")?;

        let first = last - step + 1;
        Ok((first..=last)
            .map(|n| format!("{}{n}", entity.as_str()))
            .collect())
    }
}

fn read_counter(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes)
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}
