use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::fields::{Field, FieldKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Study {
    pub id: i64,
    pub object_id: String,
    pub name: String,
}

/// A participant enrolled in a study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: i64,
    pub patient_id: String,
    pub study_id: i64,
}

/// A single stored scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Whether this value may be stored in a field of `kind`. Null fits anywhere.
    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Boolean(_), FieldKind::Boolean)
                | (Value::Integer(_), FieldKind::Integer | FieldKind::Relation)
                | (Value::Float(_), FieldKind::Float)
                | (Value::Text(_), FieldKind::Text)
                | (Value::Date(_), FieldKind::Date)
                | (Value::DateTime(_), FieldKind::DateTime)
        )
    }

    /// Total order used for sorting: nulls after every other value, as
    /// Postgres does for an ascending sort.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Date(_) => 3,
            Value::DateTime(_) => 4,
            Value::Null => 5,
        }
    }
}

/// One day of aggregated metrics for one subject. Rows are never edited
/// after they are written apart from the `deleted` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryStatisticDaily {
    pub id: i64,
    pub participant_id: i64,
    pub study_id: i64,
    pub date: NaiveDate,
    pub deleted: bool,
    pub metrics: BTreeMap<Field, Value>,
}

impl SummaryStatisticDaily {
    pub fn new(id: i64, participant_id: i64, study_id: i64, date: NaiveDate) -> Self {
        Self {
            id,
            participant_id,
            study_id,
            date,
            deleted: false,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, field: Field, value: Value) -> Self {
        debug_assert!(field.is_metric(), "{field} is not a metric");
        self.metrics.insert(field, value);
        self
    }

    /// Stored value of `field`. Relations yield the foreign key, missing
    /// metrics yield null.
    pub fn value(&self, field: Field) -> Cow<'_, Value> {
        match field {
            Field::Participant => Cow::Owned(Value::Integer(self.participant_id)),
            Field::Study => Cow::Owned(Value::Integer(self.study_id)),
            Field::Date => Cow::Owned(Value::Date(self.date)),
            metric => self
                .metrics
                .get(&metric)
                .map(Cow::Borrowed)
                .unwrap_or(Cow::Owned(Value::Null)),
        }
    }
}
