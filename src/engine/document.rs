//! Reference engine over JSON documents keyed by `_id`.
//!
//! Filters are equality matches on top-level fields. Updates are either a
//! replacement document or `$set` / `$inc` / `$unset` operator documents.

use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::core::{ErrorCode, Namespace, OperationOutcome, WriteOp, WriteResult, canon_key};
use crate::store::{DocumentRead, DocumentWrite, StoreError};

use super::{Applied, ExecutionEngine};

const ID_FIELD: &str = "_id";

#[derive(Clone, Debug, Default)]
pub struct DocumentEngine;

impl DocumentEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionEngine for DocumentEngine {
    fn apply(&self, docs: &dyn DocumentRead, op: &WriteOp) -> Result<Applied, StoreError> {
        match op {
            WriteOp::Insert { ns, document } => insert(docs, ns, document),
            WriteOp::Update {
                ns,
                filter,
                update,
                upsert,
                multi,
            } => update_many(docs, ns, filter, update, *upsert, *multi),
            WriteOp::Delete { ns, filter, multi } => delete(docs, ns, filter, *multi),
        }
    }
}

/// Operation-level failure; becomes a recorded `Failed` outcome.
struct OpFailure {
    code: ErrorCode,
    message: String,
}

impl OpFailure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn into_applied(self) -> Applied {
        Applied::failed(OperationOutcome::failed(self.code, self.message))
    }
}

fn insert(docs: &dyn DocumentRead, ns: &Namespace, document: &Value) -> Result<Applied, StoreError> {
    let Some(fields) = document.as_object() else {
        return Ok(
            OpFailure::new(ErrorCode::BadValue, "insert document must be an object").into_applied(),
        );
    };
    let mut body = fields.clone();
    let id = body
        .entry(ID_FIELD)
        .or_insert_with(generated_id)
        .clone();
    if docs.get_document(ns, &canon_key(&id))?.is_some() {
        return Ok(duplicate_key(ns, &id).into_applied());
    }
    Ok(Applied {
        outcome: OperationOutcome::Applied(WriteResult::inserted()),
        writes: vec![DocumentWrite::Put {
            ns: ns.clone(),
            id,
            body: Value::Object(body),
        }],
    })
}

fn update_many(
    docs: &dyn DocumentRead,
    ns: &Namespace,
    filter: &Value,
    update: &Value,
    upsert: bool,
    multi: bool,
) -> Result<Applied, StoreError> {
    let Some(filter) = filter.as_object() else {
        return Ok(OpFailure::new(ErrorCode::FailedToParse, "filter must be an object").into_applied());
    };
    let Some(update) = update.as_object() else {
        return Ok(OpFailure::new(ErrorCode::FailedToParse, "update must be an object").into_applied());
    };
    let replacement = !update.keys().any(|key| key.starts_with('$'));
    if replacement && multi {
        return Ok(OpFailure::new(
            ErrorCode::FailedToParse,
            "multi update is not supported for replacement-style update",
        )
        .into_applied());
    }

    let matched = find_matching(docs, ns, filter, multi)?;
    if matched.is_empty() {
        if !upsert {
            return Ok(Applied {
                outcome: OperationOutcome::Applied(WriteResult::default()),
                writes: Vec::new(),
            });
        }
        return upsert_document(docs, ns, filter, update, replacement);
    }

    let mut writes = Vec::new();
    let mut n_modified = 0u64;
    for current in &matched {
        let next = if replacement {
            replace_document(current, update)
        } else {
            apply_operators(current, update)
        };
        let next = match next {
            Ok(next) => next,
            Err(failure) => return Ok(failure.into_applied()),
        };
        if next != *current {
            n_modified += 1;
            writes.push(DocumentWrite::Put {
                ns: ns.clone(),
                id: current.get(ID_FIELD).cloned().unwrap_or(Value::Null),
                body: Value::Object(next),
            });
        }
    }
    Ok(Applied {
        outcome: OperationOutcome::Applied(WriteResult {
            n: matched.len() as u64,
            n_modified,
            upserted_id: None,
        }),
        writes,
    })
}

fn upsert_document(
    docs: &dyn DocumentRead,
    ns: &Namespace,
    filter: &Map<String, Value>,
    update: &Map<String, Value>,
    replacement: bool,
) -> Result<Applied, StoreError> {
    let seed: Map<String, Value> = filter
        .iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let built = if replacement {
        let mut body = update.clone();
        if let Some(id) = seed.get(ID_FIELD) {
            if let Some(requested) = body.get(ID_FIELD) {
                if requested != id {
                    return Ok(immutable_id().into_applied());
                }
            }
            body.insert(ID_FIELD.to_string(), id.clone());
        }
        Ok(body)
    } else {
        apply_operators(&seed, update)
    };
    let mut body = match built {
        Ok(body) => body,
        Err(failure) => return Ok(failure.into_applied()),
    };
    let id = body
        .entry(ID_FIELD)
        .or_insert_with(generated_id)
        .clone();
    if docs.get_document(ns, &canon_key(&id))?.is_some() {
        return Ok(duplicate_key(ns, &id).into_applied());
    }
    Ok(Applied {
        outcome: OperationOutcome::Applied(WriteResult {
            n: 1,
            n_modified: 0,
            upserted_id: Some(id.clone()),
        }),
        writes: vec![DocumentWrite::Put {
            ns: ns.clone(),
            id,
            body: Value::Object(body),
        }],
    })
}

fn delete(
    docs: &dyn DocumentRead,
    ns: &Namespace,
    filter: &Value,
    multi: bool,
) -> Result<Applied, StoreError> {
    let Some(filter) = filter.as_object() else {
        return Ok(OpFailure::new(ErrorCode::FailedToParse, "filter must be an object").into_applied());
    };
    let matched = find_matching(docs, ns, filter, multi)?;
    let writes: Vec<DocumentWrite> = matched
        .iter()
        .map(|doc| DocumentWrite::Delete {
            ns: ns.clone(),
            id: doc.get(ID_FIELD).cloned().unwrap_or(Value::Null),
        })
        .collect();
    Ok(Applied {
        outcome: OperationOutcome::Applied(WriteResult {
            n: writes.len() as u64,
            n_modified: 0,
            upserted_id: None,
        }),
        writes,
    })
}

fn find_matching(
    docs: &dyn DocumentRead,
    ns: &Namespace,
    filter: &Map<String, Value>,
    multi: bool,
) -> Result<Vec<Map<String, Value>>, StoreError> {
    let candidates = match filter.get(ID_FIELD) {
        Some(id) => docs
            .get_document(ns, &canon_key(id))?
            .into_iter()
            .collect::<Vec<_>>(),
        None => docs
            .scan_documents(ns)?
            .into_iter()
            .map(|doc| doc.body)
            .collect(),
    };
    let mut matched = Vec::new();
    for candidate in candidates {
        let Value::Object(fields) = candidate else {
            continue;
        };
        if matches_filter(&fields, filter) {
            matched.push(fields);
            if !multi {
                break;
            }
        }
    }
    Ok(matched)
}

fn matches_filter(doc: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, expected)| doc.get(key) == Some(expected))
}

fn replace_document(
    current: &Map<String, Value>,
    replacement: &Map<String, Value>,
) -> Result<Map<String, Value>, OpFailure> {
    let id = current.get(ID_FIELD).cloned().unwrap_or(Value::Null);
    if let Some(requested) = replacement.get(ID_FIELD) {
        if *requested != id {
            return Err(immutable_id());
        }
    }
    let mut next = replacement.clone();
    next.insert(ID_FIELD.to_string(), id);
    Ok(next)
}

fn apply_operators(
    current: &Map<String, Value>,
    update: &Map<String, Value>,
) -> Result<Map<String, Value>, OpFailure> {
    let mut next = current.clone();
    for (operator, args) in update {
        let Some(args) = args.as_object() else {
            return Err(OpFailure::new(
                ErrorCode::FailedToParse,
                format!("modifier {operator} expects an object"),
            ));
        };
        for (field, value) in args {
            if field == ID_FIELD && operator != "$set" {
                return Err(immutable_id());
            }
            match operator.as_str() {
                "$set" => {
                    if field == ID_FIELD && current.get(ID_FIELD).is_some_and(|id| id != value) {
                        return Err(immutable_id());
                    }
                    next.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    next.remove(field);
                }
                "$inc" => {
                    let sum = increment(next.get(field), value, field)?;
                    next.insert(field.clone(), sum);
                }
                other => {
                    return Err(OpFailure::new(
                        ErrorCode::FailedToParse,
                        format!("Unknown modifier: {other}"),
                    ));
                }
            }
        }
    }
    Ok(next)
}

fn increment(current: Option<&Value>, delta: &Value, field: &str) -> Result<Value, OpFailure> {
    let Value::Number(delta) = delta else {
        return Err(OpFailure::new(
            ErrorCode::BadValue,
            format!("Cannot increment with non-numeric argument: {{{field}: {delta}}}"),
        ));
    };
    let current = match current {
        None => return Ok(Value::Number(delta.clone())),
        Some(Value::Number(current)) => current,
        Some(other) => {
            return Err(OpFailure::new(
                ErrorCode::BadValue,
                format!("Cannot apply $inc to a value of non-numeric type. {{{field}: {other}}}"),
            ));
        }
    };
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::Number(sum.into()));
        }
    }
    let sum = current.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).ok_or_else(|| {
        OpFailure::new(
            ErrorCode::BadValue,
            format!("$inc on {field} produced a non-finite value"),
        )
    })
}

fn generated_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

fn duplicate_key(ns: &Namespace, id: &Value) -> OpFailure {
    OpFailure::new(
        ErrorCode::DuplicateKey,
        format!("E11000 duplicate key error collection: {ns} index: _id_ dup key: {{ _id: {id} }}"),
    )
}

fn immutable_id() -> OpFailure {
    OpFailure::new(
        ErrorCode::ImmutableField,
        "Performing an update on the path '_id' would modify the immutable field '_id'",
    )
}
