//! Transactional writes over the single table.
//!
//! A batch of [`WriteOp`]s is split into chunks of at most
//! `max_transaction_items`; each chunk commits all-or-nothing together with
//! the index entries it moves. Updates persist only the fields named on the
//! operation and are checked against the version the row was read at.
use crate::error::RequisitionError;
use crate::model::{Record, RequisitionHeader, RequisitionItem, decode_record, encode_record, row_key};
use crate::table::{Table, index_key};
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree, abort,
};
use tracing::debug;

/// Attribute groups an update may persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Relations,
    Status,
    Quantity,
    Catalog,
    RequireDate,
    Motive,
    Observations,
    FileExtension,
    Reason,
    Approval,
    Cancellation,
    Process,
    /// Linked outbound/request documents.
    Downstream,
    /// Movement ids, fulfilled quantity and applied event tokens.
    Association,
    Bag,
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a row that must not exist yet.
    Put(Record),
    /// Insert or overwrite an unversioned reference row.
    Replace(Record),
    Update {
        record: Record,
        fields: Vec<Field>,
        expected_version: u64,
    },
    Delete {
        pk: String,
        sk: String,
        expected_version: u64,
    },
}

impl WriteOp {
    /// Update from the in-memory record, persisting only `fields`.
    pub fn update(record: Record, fields: &[Field]) -> Self {
        let expected_version = record.version().unwrap_or(0);
        WriteOp::Update {
            record,
            fields: fields.to_vec(),
            expected_version,
        }
    }

    pub fn delete_item(item: &RequisitionItem) -> Self {
        WriteOp::Delete {
            pk: item.pk.clone(),
            sk: item.sk.clone(),
            expected_version: item.version,
        }
    }
}

impl RequisitionHeader {
    fn merge_fields(&mut self, from: &Self, fields: &[Field]) {
        for field in fields {
            match field {
                Field::Relations => self.relations = from.relations.clone(),
                Field::Status => self.status = from.status,
                Field::RequireDate => self.require_date = from.require_date,
                Field::Motive => self.motive = from.motive.clone(),
                Field::Observations => self.observations = from.observations.clone(),
                Field::FileExtension => self.file_extension = from.file_extension.clone(),
                Field::Reason => self.reason = from.reason.clone(),
                Field::Approval => self.approval = from.approval.clone(),
                Field::Cancellation => self.cancellation = from.cancellation.clone(),
                Field::Process => self.process = from.process.clone(),
                Field::Downstream => {
                    self.out = from.out.clone();
                    self.request = from.request.clone();
                }
                Field::Association => self.associate = from.associate.clone(),
                Field::Quantity | Field::Catalog | Field::Bag => {}
            }
        }
    }
}

impl RequisitionItem {
    fn merge_fields(&mut self, from: &Self, fields: &[Field]) {
        for field in fields {
            match field {
                Field::Relations => self.relations = from.relations.clone(),
                Field::Quantity => self.quantity = from.quantity,
                Field::Catalog => {
                    self.item = from.item.clone();
                    self.catalog = from.catalog.clone();
                }
                Field::Downstream => {
                    self.associate_out = from.associate_out.clone();
                    self.associate_request = from.associate_request.clone();
                }
                Field::Association => {
                    self.associate = from.associate.clone();
                    self.associated_quantity = from.associated_quantity;
                    self.applied_events = from.applied_events.clone();
                }
                Field::Bag => self.bag_quantity = from.bag_quantity,
                _ => {}
            }
        }
    }
}

impl Record {
    fn merge_fields(&mut self, from: &Record, fields: &[Field]) -> Result<(), RequisitionError> {
        match (self, from) {
            (Record::Requisition(stored), Record::Requisition(from)) => {
                stored.merge_fields(from, fields);
                Ok(())
            }
            (Record::Item(stored), Record::Item(from)) => {
                stored.merge_fields(from, fields);
                Ok(())
            }
            (stored, _) => {
                let (pk, sk) = stored.key();
                Err(RequisitionError::Storage(format!(
                    "{pk}/{sk} cannot be updated field by field"
                )))
            }
        }
    }
}

#[derive(Clone)]
pub struct TransactionWriter {
    table: Table,
    max_items: usize,
}

impl TransactionWriter {
    pub fn new(table: Table, max_items: usize) -> Self {
        Self {
            table,
            max_items: max_items.max(1),
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Whether `operations` commit in a single chunk.
    pub fn fits(&self, operations: usize) -> bool {
        operations <= self.max_items
    }

    /// Commit `ops` in order. Each chunk is atomic; chunks are not atomic with each other.
    pub fn write_transaction(&self, ops: &[WriteOp]) -> anyhow::Result<()> {
        let chunks = ops.len().div_ceil(self.max_items);
        debug!(operations = ops.len(), chunks, "writing transaction");

        for chunk in ops.chunks(self.max_items) {
            self.commit_chunk(chunk)?;
        }
        Ok(())
    }

    fn commit_chunk(&self, ops: &[WriteOp]) -> anyhow::Result<()> {
        let result = (self.table.rows(), self.table.index()).transaction(|(rows, index)| {
            for op in ops {
                apply(rows, index, op)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e.into()),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}

fn apply(
    rows: &TransactionalTree,
    index: &TransactionalTree,
    op: &WriteOp,
) -> ConflictableTransactionResult<(), RequisitionError> {
    match op {
        WriteOp::Put(record) => {
            let (pk, sk) = record.key();
            let key = row_key(pk, sk);
            if rows.get(&key)?.is_some() {
                return abort(RequisitionError::DuplicateId(format!("{pk}/{sk}")));
            }
            store(rows, index, &key, record)
        }
        WriteOp::Replace(record) => {
            let (pk, sk) = record.key();
            if record.version().is_some() {
                return abort(RequisitionError::Storage(format!(
                    "{pk}/{sk} is versioned and cannot be replaced"
                )));
            }
            let key = row_key(pk, sk);
            if let Some(bytes) = rows.get(&key)? {
                let stored = decode_record(&bytes).map_err(ConflictableTransactionError::Abort)?;
                unindex(index, &stored)?;
            }
            store(rows, index, &key, record)
        }
        WriteOp::Update {
            record,
            fields,
            expected_version,
        } => {
            let (pk, sk) = record.key();
            let key = row_key(pk, sk);
            let mut stored = load_checked(rows, &key, pk, sk, *expected_version)?;

            unindex(index, &stored)?;
            stored
                .merge_fields(record, fields)
                .map_err(ConflictableTransactionError::Abort)?;
            stored.bump_version();
            store(rows, index, &key, &stored)
        }
        WriteOp::Delete {
            pk,
            sk,
            expected_version,
        } => {
            let key = row_key(pk, sk);
            let stored = load_checked(rows, &key, pk, sk, *expected_version)?;

            unindex(index, &stored)?;
            rows.remove(key)?;
            Ok(())
        }
    }
}

fn load_checked(
    rows: &TransactionalTree,
    key: &[u8],
    pk: &str,
    sk: &str,
    expected_version: u64,
) -> ConflictableTransactionResult<Record, RequisitionError> {
    let Some(bytes) = rows.get(key)? else {
        return abort(RequisitionError::RequisitionNotFound(format!("{pk}/{sk}")));
    };
    let stored = decode_record(&bytes).map_err(ConflictableTransactionError::Abort)?;

    if stored.version().is_some_and(|version| version != expected_version) {
        return abort(RequisitionError::Conflict {
            pk: pk.to_string(),
            sk: sk.to_string(),
        });
    }
    Ok(stored)
}

fn store(
    rows: &TransactionalTree,
    index: &TransactionalTree,
    key: &[u8],
    record: &Record,
) -> ConflictableTransactionResult<(), RequisitionError> {
    let bytes = encode_record(record).map_err(ConflictableTransactionError::Abort)?;
    rows.insert(key, bytes)?;

    let (pk, sk) = record.key();
    for (name, relation) in record.index_entries() {
        index.insert(index_key(name, record.entity(), &relation, pk, sk), key)?;
    }
    Ok(())
}

fn unindex(
    index: &TransactionalTree,
    record: &Record,
) -> ConflictableTransactionResult<(), RequisitionError> {
    let (pk, sk) = record.key();
    for (name, relation) in record.index_entries() {
        index.remove(index_key(name, record.entity(), &relation, pk, sk))?;
    }
    Ok(())
}
