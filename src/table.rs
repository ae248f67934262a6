//! The single table: every entity row lives in one keyspace, addressed by
//! `PK\0SK`, with secondary indexes kept in a sibling tree.
//!
//! Index keys are `INDEX\0ENTITY\0relation\0PK\0SK` and point back at the row
//! key, so a prefix or range over the relation part is an index query.
use crate::error::RequisitionError;
use crate::ids::IdAllocator;
use crate::model::{
    BagItem, Entity, KEY_SEPARATOR, Record, decode_record, encode_record, partition_prefix, row_key,
};
use crate::relation::IndexName;
use anyhow::Context;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::sync::Arc;

/// How an index (or the base table) is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCondition {
    /// Base table: one partition, optionally one row of it.
    Partition { pk: String, sk: Option<String> },
    /// Relation equals the value.
    Exact(String),
    /// Relation starts with the value.
    Prefix(String),
    /// Relation lies in `[from, to]`.
    Between { from: String, to: String },
}

#[derive(Clone)]
pub struct Table {
    rows: Tree,
    index: Tree,
    counters: Tree,
}

impl Table {
    pub fn open(db: Arc<Db>) -> anyhow::Result<Self> {
        Ok(Self {
            rows: db.open_tree("rows")?,
            index: db.open_tree("index")?,
            counters: db.open_tree("counters")?,
        })
    }

    pub fn ids(&self) -> IdAllocator {
        IdAllocator::new(self.counters.clone())
    }

    pub(crate) fn rows(&self) -> &Tree {
        &self.rows
    }

    pub(crate) fn index(&self) -> &Tree {
        &self.index
    }

    pub fn get(&self, pk: &str, sk: &str) -> anyhow::Result<Option<Record>> {
        self.fetch(&row_key(pk, sk))
    }

    /// All rows sharing a partition key, in sort-key order.
    pub fn partition(&self, pk: &str) -> anyhow::Result<Vec<Record>> {
        self.rows
            .scan_prefix(partition_prefix(pk))
            .map(|entry| {
                let (_, value) = entry?;
                Ok(decode_record(&value)?)
            })
            .collect()
    }

    /// Match `condition` on `index`, or on the base table when no index is given.
    pub fn scan(
        &self,
        index: Option<IndexName>,
        entity: Entity,
        condition: &KeyCondition,
    ) -> anyhow::Result<Vec<Record>> {
        if let KeyCondition::Partition { pk, sk } = condition {
            return match sk {
                Some(sk) => Ok(self.get(pk, sk)?.into_iter().collect()),
                None => self.partition(pk),
            };
        }
        let index = index.context("relation conditions need a secondary index")?;

        let scope = index_scope(index, entity);
        let pointers: Vec<sled::IVec> = match condition {
            KeyCondition::Partition { .. } => vec![],
            KeyCondition::Exact(relation) => {
                let mut prefix = join(&scope, relation.as_bytes());
                prefix.push(KEY_SEPARATOR);
                self.index
                    .scan_prefix(prefix)
                    .values()
                    .collect::<Result<_, _>>()?
            }
            KeyCondition::Prefix(relation) => self
                .index
                .scan_prefix(join(&scope, relation.as_bytes()))
                .values()
                .collect::<Result<_, _>>()?,
            KeyCondition::Between { from, to } => {
                let start = join(&scope, from.as_bytes());
                let end = join(&scope, to.as_bytes());
                self.index
                    .range(start..=end)
                    .values()
                    .collect::<Result<_, _>>()?
            }
        };

        let mut records = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            // An index entry without its row is tolerated; both are written in one transaction.
            if let Some(record) = self.fetch(&pointer)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Add `delta` to a bag row, creating it from `template` at zero when absent.
    /// The stored quantity is only ever incremented.
    pub fn increment_bag(&self, template: &BagItem, delta: u64) -> anyhow::Result<u64> {
        let key = row_key(&template.pk, &template.sk);

        let result = self.rows.transaction(|rows| {
            let mut bag = match rows.get(&key)? {
                Some(bytes) => decode_record(&bytes)
                    .map_err(ConflictableTransactionError::Abort)?
                    .into_bag()
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(RequisitionError::Storage(format!(
                            "{}/{} is not a bag row",
                            template.pk, template.sk
                        )))
                    })?,
                None => BagItem {
                    quantity: 0,
                    ..template.clone()
                },
            };
            bag.quantity = bag.quantity.saturating_add(delta);

            let bytes = encode_record(&Record::Bag(bag.clone()))
                .map_err(ConflictableTransactionError::Abort)?;
            rows.insert(key.as_slice(), bytes)?;
            Ok(bag.quantity)
        });

        match result {
            Ok(quantity) => Ok(quantity),
            Err(TransactionError::Abort(e)) => Err(e.into()),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    fn fetch(&self, key: &[u8]) -> anyhow::Result<Option<Record>> {
        match self.rows.get(key)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn index_scope(index: IndexName, entity: Entity) -> Vec<u8> {
    let mut scope = Vec::new();
    scope.extend_from_slice(index.as_str().as_bytes());
    scope.push(KEY_SEPARATOR);
    scope.extend_from_slice(entity.as_str().as_bytes());
    scope.push(KEY_SEPARATOR);
    scope
}

fn join(scope: &[u8], tail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(scope.len() + tail.len());
    key.extend_from_slice(scope);
    key.extend_from_slice(tail);
    key
}

/// Full index key of one entry.
pub(crate) fn index_key(index: IndexName, entity: Entity, relation: &str, pk: &str, sk: &str) -> Vec<u8> {
    let mut key = join(&index_scope(index, entity), relation.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&row_key(pk, sk));
    key
}
