use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::pin::Pin;

use crate::error::Error;

/// A row-level change reported by a realtime feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Change<T> {
    Insert {
        record: T,
    },
    Update {
        old_record: Option<T>,
        record: T,
    },
    Delete {
        old_record: T,
    },
}

impl<T> Change<T> {
    /// The latest known version of the row.
    pub fn record(&self) -> &T {
        match self {
            Self::Insert { record } => record,
            Self::Update { record, .. } => record,
            Self::Delete { old_record } => old_record,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

pub type ChangeStream<T> = Pin<Box<dyn Stream<Item = Result<Change<T>, Error>> + Send>>;

/// Turns two snapshots of the same table into the changes between them.
/// Inserts and updates follow the order of `current`.
pub fn diff<K, T, F>(previous: &HashMap<K, T>, current: &[T], key: F) -> Vec<Change<T>>
where
    K: Eq + Hash,
    T: Clone + PartialEq,
    F: Fn(&T) -> K,
{
    let mut changes = Vec::new();
    let mut seen = HashMap::with_capacity(current.len());

    for record in current {
        let k = key(record);

        match previous.get(&k) {
            None => changes.push(Change::Insert {
                record: record.clone(),
            }),
            Some(old) if old != record => changes.push(Change::Update {
                old_record: Some(old.clone()),
                record: record.clone(),
            }),
            Some(_) => {}
        }

        seen.insert(k, ());
    }

    for (k, old) in previous {
        if !seen.contains_key(k) {
            changes.push(Change::Delete {
                old_record: old.clone(),
            });
        }
    }

    changes
}
