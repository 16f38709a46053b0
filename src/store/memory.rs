use std::cmp::Ordering;

use anyhow::anyhow;
use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::sync::Mutex;

use super::{DocumentStore, IndexSpec, ReturnPolicy, StoreError};

/// In-process collection with the same per-document atomicity as the server.
///
/// Supports equality filters, `$lt`/`$lte`/`$gt`/`$gte`/`$ne`/`$in`/`$exists` operators, `$set`/`$unset`
/// updates and partial unique indexes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored document in insertion order.
    pub async fn documents(&self) -> Vec<Document> {
        self.state.lock().await.documents.clone()
    }
}

impl State {
    /// Fails if `candidate` would collide with another document on a unique index.
    fn check_unique(&self, candidate: &Document, skip: Option<usize>) -> Result<(), StoreError> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            if !covers(index, candidate)? {
                continue;
            }
            let key = index_key(&index.keys, candidate);
            for (position, existing) in self.documents.iter().enumerate() {
                if Some(position) != skip && covers(index, existing)? && index_key(&index.keys, existing) == key {
                    return Err(StoreError::DuplicateKey(format!(
                        "E11000 duplicate key error index: {}",
                        index.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn covers(index: &IndexSpec, document: &Document) -> Result<bool, StoreError> {
    match &index.partial_filter {
        Some(filter) => matches_filter(document, filter),
        None => Ok(true),
    }
}

fn index_key(keys: &Document, document: &Document) -> Vec<Bson> {
    keys.keys()
        .map(|field| document.get(field).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn compare(left: &Bson, right: &Bson) -> Option<Ordering> {
    match (left, right) {
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.timestamp_millis().cmp(&b.timestamp_millis())),
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        (Bson::Int32(a), Bson::Int32(b)) => Some(a.cmp(b)),
        (Bson::Int64(a), Bson::Int64(b)) => Some(a.cmp(b)),
        (Bson::Int32(a), Bson::Int64(b)) => Some(i64::from(*a).cmp(b)),
        (Bson::Int64(a), Bson::Int32(b)) => Some(a.cmp(&i64::from(*b))),
        (Bson::Double(a), Bson::Double(b)) => a.partial_cmp(b),
        _ => None,
    }
}

fn is_operator_document(condition: &Bson) -> bool {
    match condition {
        Bson::Document(inner) => !inner.is_empty() && inner.keys().all(|key| key.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> Result<bool, StoreError> {
    let Bson::Document(operators) = condition else {
        return Ok(value.unwrap_or(&Bson::Null) == condition);
    };
    if !is_operator_document(condition) {
        return Ok(value == Some(condition));
    }

    for (operator, operand) in operators {
        let ordering = value.and_then(|value| compare(value, operand));
        let matched = match operator.as_str() {
            "$lt" => ordering == Some(Ordering::Less),
            "$lte" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            "$gt" => ordering == Some(Ordering::Greater),
            "$gte" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            "$ne" => value.unwrap_or(&Bson::Null) != operand,
            "$in" => {
                let candidates = operand
                    .as_array()
                    .ok_or_else(|| anyhow!("$in expects an array"))?;
                candidates.contains(value.unwrap_or(&Bson::Null))
            }
            "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
            other => return Err(anyhow!("unsupported filter operator {other}").into()),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_filter(document: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (field, condition) in filter {
        if !matches_condition(document.get(field), condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_update(document: &mut Document, update: &Document) -> Result<(), StoreError> {
    for (operator, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| anyhow!("{operator} expects a document"))?;
        match operator.as_str() {
            "$set" => {
                for (field, value) in fields {
                    document.insert(field.clone(), value.clone());
                }
            }
            "$unset" => {
                for field in fields.keys() {
                    document.remove(field);
                }
            }
            other => return Err(anyhow!("unsupported update operator {other}").into()),
        }
    }
    Ok(())
}

/// Orders two documents by a `{ field: 1 | -1, .. }` sort specification.
fn sort_order(sort: &Document, left: &Document, right: &Document) -> Ordering {
    for (field, direction) in sort {
        let descending = matches!(direction, Bson::Int32(d) if *d < 0) || matches!(direction, Bson::Int64(d) if *d < 0);
        let ordering = match (left.get(field), right.get(field)) {
            (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = if descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, document: Document) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_unique(&document, None)?;
        state.documents.push(document);
        Ok(())
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        let state = self.state.lock().await;
        for document in &state.documents {
            if matches_filter(document, &filter)? {
                return Ok(Some(document.clone()));
            }
        }
        Ok(None)
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        sort: Option<Document>,
        return_policy: ReturnPolicy,
    ) -> Result<Option<Document>, StoreError> {
        let mut state = self.state.lock().await;

        let mut selected: Option<usize> = None;
        for (position, document) in state.documents.iter().enumerate() {
            if !matches_filter(document, &filter)? {
                continue;
            }
            selected = match (selected, &sort) {
                (None, _) => Some(position),
                (Some(current), Some(sort))
                    if sort_order(sort, document, &state.documents[current]) == Ordering::Less =>
                {
                    Some(position)
                }
                (current, _) => current,
            };
            if sort.is_none() {
                break;
            }
        }
        let Some(position) = selected else {
            return Ok(None);
        };

        let before = state.documents[position].clone();
        let mut after = before.clone();
        apply_update(&mut after, &update)?;
        state.check_unique(&after, Some(position))?;
        state.documents[position] = after.clone();

        Ok(Some(match return_policy {
            ReturnPolicy::Before => before,
            ReturnPolicy::After => after,
        }))
    }

    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.indexes.iter().find(|existing| existing.name == index.name) {
            if *existing == index {
                return Ok(());
            }
            return Err(anyhow!("index {} already exists with different options", index.name).into());
        }

        if index.unique {
            let mut seen = Vec::with_capacity(state.documents.len());
            for document in &state.documents {
                if !covers(&index, document)? {
                    continue;
                }
                let key = index_key(&index.keys, document);
                if seen.contains(&key) {
                    return Err(StoreError::DuplicateKey(format!(
                        "E11000 duplicate key error building index: {}",
                        index.name
                    )));
                }
                seen.push(key);
            }
        }
        state.indexes.push(index);
        Ok(())
    }
}
