//! Columnar sibling blobs of data objects.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageResult;
use crate::id::Id;
use crate::object::DataObject;
use crate::store::ObjectStore;
use crate::uri::StorageUri;
use crate::value::Value;

const THIS: &str = "this";

/// One column per top-level field; non-record values land in `this`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorObject {
    /// Row count.
    pub rows: u64,
    /// Columns in first-seen field order. Missing cells are `Null`.
    pub columns: Vec<(String, Vec<Value>)>,
}

impl VectorObject {
    /// Pivot row-oriented records into columns.
    pub fn from_records(records: &[Value]) -> Self {
        let mut columns: Vec<(String, Vec<Value>)> = Vec::new();
        for (row, rec) in records.iter().enumerate() {
            let fields: Vec<(&str, &Value)> = match rec {
                Value::Record(fields) => fields.iter().map(|(k, v)| (k.as_str(), v)).collect(),
                other => vec![(THIS, other)],
            };
            for (name, value) in fields {
                let idx = match columns.iter().position(|(n, _)| n == name) {
                    Some(i) => i,
                    None => {
                        columns.push((name.to_string(), vec![Value::Null; row]));
                        columns.len() - 1
                    }
                };
                columns[idx].1.push(value.clone());
            }
            for (_, col) in columns.iter_mut() {
                if col.len() < row + 1 {
                    col.push(Value::Null);
                }
            }
        }
        Self {
            rows: records.len() as u64,
            columns,
        }
    }

    /// Rebuild row-oriented records. Null cells are dropped from records.
    pub fn to_records(&self) -> Vec<Value> {
        (0..self.rows as usize)
            .map(|row| {
                if let [(name, col)] = self.columns.as_slice() {
                    if name == THIS {
                        return col[row].clone();
                    }
                }
                Value::Record(
                    self.columns
                        .iter()
                        .filter(|(_, col)| !col[row].is_null())
                        .map(|(name, col)| (name.clone(), col[row].clone()))
                        .collect(),
                )
            })
            .collect()
    }

    /// Persist as the vector blob of object `id`.
    pub async fn write(&self, store: &dyn ObjectStore, dir: &StorageUri, id: Id) -> StorageResult<()> {
        let data = bincode::serialize(self)?;
        store.put(&DataObject::vector_uri(dir, id), Bytes::from(data)).await?;
        debug!(object = %id, rows = self.rows, columns = self.columns.len(), "wrote vector object");
        Ok(())
    }

    /// Load the vector blob of object `id`; `None` if it was never written.
    pub async fn read(store: &dyn ObjectStore, dir: &StorageUri, id: Id) -> StorageResult<Option<Self>> {
        match store.get(&DataObject::vector_uri(dir, id)).await {
            Ok(data) => Ok(Some(bincode::deserialize(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
