use std::collections::HashMap;

use chrono::SecondsFormat;
use serde_json::{Map, Number, Value as JsonValue};

use crate::fields::Field;
use crate::models::{Study, Subject, SummaryStatisticDaily, Value};

/// Lookup tables from internal keys to the related objects, used to turn
/// the two relational fields into public identifiers.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    studies: HashMap<i64, Study>,
    subjects: HashMap<i64, Subject>,
}

impl Directory {
    pub fn insert_study(&mut self, study: Study) {
        self.studies.insert(study.id, study);
    }

    pub fn insert_subject(&mut self, subject: Subject) {
        self.subjects.insert(subject.id, subject);
    }

    pub fn study_object_id(&self, id: i64) -> Option<&str> {
        self.studies.get(&id).map(|study| study.object_id.as_str())
    }

    pub fn patient_id(&self, id: i64) -> Option<&str> {
        self.subjects.get(&id).map(|subject| subject.patient_id.as_str())
    }
}

/// Invariant violations while serializing. These are bugs, never user errors.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("record {record} references participant {participant} which is not loaded")]
    UnresolvedParticipant { record: i64, participant: i64 },
    #[error("record {record} references study {study} which is not loaded")]
    UnresolvedStudy { record: i64, study: i64 },
    #[error("record {record} stores {value:?} in {field}, which has kind {kind:?}")]
    KindMismatch {
        record: i64,
        field: Field,
        kind: crate::fields::FieldKind,
        value: Value,
    },
}

pub type Row = Map<String, JsonValue>;

/// Emits the requested fields of every record, in canonical field order
/// whatever order `fields` is in.
pub fn project(
    records: &[SummaryStatisticDaily],
    fields: &[Field],
    directory: &Directory,
) -> Result<Vec<Row>, SerializeError> {
    let selected: Vec<Field> = Field::ALL
        .iter()
        .copied()
        .filter(|field| fields.contains(field))
        .collect();

    records
        .iter()
        .map(|record| project_record(record, &selected, directory))
        .collect()
}

fn project_record(
    record: &SummaryStatisticDaily,
    fields: &[Field],
    directory: &Directory,
) -> Result<Row, SerializeError> {
    let mut row = Map::with_capacity(fields.len());
    for &field in fields {
        let value = match field {
            Field::Participant => directory
                .patient_id(record.participant_id)
                .map(|id| JsonValue::String(id.to_string()))
                .ok_or(SerializeError::UnresolvedParticipant {
                    record: record.id,
                    participant: record.participant_id,
                })?,
            Field::Study => directory
                .study_object_id(record.study_id)
                .map(|id| JsonValue::String(id.to_string()))
                .ok_or(SerializeError::UnresolvedStudy {
                    record: record.id,
                    study: record.study_id,
                })?,
            other => {
                let stored = record.value(other);
                if !stored.fits(other.kind()) {
                    return Err(SerializeError::KindMismatch {
                        record: record.id,
                        field: other,
                        kind: other.kind(),
                        value: stored.into_owned(),
                    });
                }
                to_json(&stored)
            }
        };
        row.insert(field.as_str().to_string(), value);
    }
    Ok(row)
}

fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(flag) => JsonValue::Bool(*flag),
        Value::Integer(number) => JsonValue::Number((*number).into()),
        // non-finite floats have no JSON form
        Value::Float(number) => Number::from_f64(*number)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(text) => JsonValue::String(text.clone()),
        Value::Date(date) => JsonValue::String(date.format("%Y-%m-%d").to_string()),
        Value::DateTime(moment) => {
            JsonValue::String(moment.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
    }
}
