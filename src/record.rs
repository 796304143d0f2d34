use std::sync::Arc;

use crate::value::GraphValue;

/// One row of a query result: named fields in the order the query returned them.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    keys: Arc<[String]>,
    values: Vec<GraphValue>,
}

impl Record {
    /// Keys and values must have the same length.
    pub fn new(keys: Arc<[String]>, values: Vec<GraphValue>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        Self { keys, values }
    }

    pub fn from_pairs<K: Into<String>>(pairs: Vec<(K, GraphValue)>) -> Self {
        let (keys, values): (Vec<String>, Vec<GraphValue>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(keys.into(), values)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[GraphValue] {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&GraphValue> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|idx| &self.values[idx])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GraphValue)> {
        self.keys.iter().map(|k| k.as_str()).zip(self.values.iter())
    }
}

/// Raw output of one statement as a transport produced it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<GraphValue>>,
    /// Rows written by the statement, when the transport reports it.
    pub rows_affected: Option<u64>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<GraphValue>>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
        }
    }

    /// Splits rows into records sharing one key list.
    pub fn into_records(self) -> Vec<Record> {
        let keys: Arc<[String]> = self.columns.into();
        self.rows
            .into_iter()
            .map(|row| Record::new(Arc::clone(&keys), row))
            .collect()
    }
}
