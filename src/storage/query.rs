//! Filter matching and update application for the in-memory engine.
//!
//! Covers the subset of the MongoDB query language the data-access layer
//! issues. Anything outside it is rejected instead of silently matching.

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::common::error::{StorageError, StorageResult};

/// Check if a document matches a filter. An empty filter matches everything.
pub fn matches(document: &Document, filter: &Document) -> StorageResult<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_of(document, condition)?,
            "$or" => any_of(document, condition)?,
            op if op.starts_with('$') => {
                return Err(StorageError::Rejected(format!("unsupported query operator {op}")));
            }
            path => field_matches(lookup(document, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses(condition: &Bson) -> StorageResult<Vec<&Document>> {
    let Bson::Array(items) = condition else {
        return Err(StorageError::Rejected("$and/$or expects an array".into()));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d),
            _ => Err(StorageError::Rejected("$and/$or entries must be documents".into())),
        })
        .collect()
}

fn all_of(document: &Document, condition: &Bson) -> StorageResult<bool> {
    for clause in clauses(condition)? {
        if !matches(document, clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(document: &Document, condition: &Bson) -> StorageResult<bool> {
    for clause in clauses(condition)? {
        if matches(document, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_doc(condition: &Bson) -> bool {
    match condition {
        Bson::Document(d) => !d.is_empty() && d.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> StorageResult<bool> {
    let Bson::Document(ops) = condition else {
        return Ok(equals(value, condition));
    };
    if !is_operator_doc(condition) {
        return Ok(equals(value, condition));
    }

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compare(value, operand) == Some(Ordering::Greater),
            "$gte" => matches!(compare(value, operand), Some(Ordering::Greater | Ordering::Equal)),
            "$lt" => compare(value, operand) == Some(Ordering::Less),
            "$lte" => matches!(compare(value, operand), Some(Ordering::Less | Ordering::Equal)),
            "$in" => in_list(value, operand)?,
            "$nin" => !in_list(value, operand)?,
            "$exists" => value.is_some() == truthy(operand),
            other => {
                return Err(StorageError::Rejected(format!("unsupported query operator {other}")));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(value: Option<&Bson>, operand: &Bson) -> StorageResult<bool> {
    let Bson::Array(items) = operand else {
        return Err(StorageError::Rejected("$in/$nin expects an array".into()));
    };
    Ok(items.iter().any(|item| equals(value, item)))
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).is_none_or(|n| n != 0.0),
    }
}

/// Field equality; a missing field equals `null`, arrays match any element.
fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
        return x == y;
    }
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(value: Option<&Bson>, operand: &Bson) -> Option<Ordering> {
    let value = value?;
    if let (Some(x), Some(y)) = (as_i64(value), as_i64(operand)) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (as_f64(value), as_f64(operand)) {
        return x.partial_cmp(&y);
    }
    match (value, operand) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Integer value, when exact comparison is possible
fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Resolve a dotted path
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(d) => d.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> StorageResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(child)) => set_path(child, rest, value),
                _ => Err(StorageError::Rejected(format!(
                    "cannot create field '{rest}' in non-document '{head}'"
                ))),
            }
        }
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                unset_path(child, rest);
            }
        }
    }
}

/// Make sure an update uses operators only
pub fn validate_update(update: &Document) -> StorageResult<()> {
    if update.is_empty() {
        return Err(StorageError::Rejected("update document must not be empty".into()));
    }
    if let Some(key) = update.keys().find(|k| !k.starts_with('$')) {
        return Err(StorageError::Rejected(format!(
            "update document requires atomic operators, found '{key}'"
        )));
    }
    Ok(())
}

/// Apply an operator update in place. Returns whether the document changed.
pub fn apply_update(document: &mut Document, update: &Document) -> StorageResult<bool> {
    validate_update(update)?;
    let before = document.clone();

    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(StorageError::Rejected(format!("{op} expects a document")));
        };
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(StorageError::Rejected("the _id field is immutable".into()));
            }
            match op.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$unset" => unset_path(document, path),
                "$inc" => {
                    let incremented = increment(lookup(document, path), value)?;
                    set_path(document, path, incremented)?;
                }
                other => {
                    return Err(StorageError::Rejected(format!("unsupported update operator {other}")));
                }
            }
        }
    }

    Ok(*document != before)
}

fn increment(current: Option<&Bson>, by: &Bson) -> StorageResult<Bson> {
    let current = current.unwrap_or(&Bson::Int32(0));
    let result = match (current, by) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(n) => Bson::Int32(n),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(checked_inc(i64::from(*a), *b)?),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(checked_inc(*a, i64::from(*b))?),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(checked_inc(*a, *b)?),
        (a, b) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Bson::Double(x + y),
            _ => {
                return Err(StorageError::Rejected("cannot apply $inc to a non-numeric value".into()));
            }
        },
    };
    Ok(result)
}

fn checked_inc(a: i64, b: i64) -> StorageResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| StorageError::Rejected("$inc overflow".into()))
}

/// The document an upsert starts from: equality fields of the filter.
pub fn upsert_seed(filter: &Document) -> StorageResult<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> StorageResult<()> {
    for (key, condition) in filter {
        if key == "$and" {
            for clause in clauses(condition)? {
                collect_equalities(clause, seed)?;
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        if is_operator_doc(condition) {
            if let Bson::Document(ops) = condition {
                if let Some(value) = ops.get("$eq") {
                    set_path(seed, key, value.clone())?;
                }
            }
        } else {
            set_path(seed, key, condition.clone())?;
        }
    }
    Ok(())
}
