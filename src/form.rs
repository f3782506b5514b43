use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use chrono::NaiveDate;

use crate::fields::Field;
use crate::query::Direction;
use crate::store::StatisticsStore;

pub const STUDY_ID: &str = "study_id";
pub const END_DATE: &str = "end_date";
pub const START_DATE: &str = "start_date";
pub const LIMIT: &str = "limit";
pub const ORDERED_BY: &str = "ordered_by";
pub const ORDER_DIRECTION: &str = "order_direction";
pub const PARTICIPANT_IDS: &str = "participant_ids";
pub const FIELDS: &str = "fields";

/// Every parameter name the daily statistics endpoint accepts, in the order
/// their errors are reported.
pub const RECOGNIZED_PARAMETERS: [&str; 8] = [
    STUDY_ID,
    END_DATE,
    START_DATE,
    LIMIT,
    ORDERED_BY,
    ORDER_DIRECTION,
    PARTICIPANT_IDS,
    FIELDS,
];

const DATE_FORMAT: &str = "%m/%d/%Y";

/// Query string parameters as received. A repeated name keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParams {
    pairs: Vec<(String, String)>,
}

impl RawParams {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    /// Like `get`, but an empty value counts as absent.
    fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).map(str::trim).filter(|value| !value.is_empty())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(name, _)| name.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = RawParams::default();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// A validated, fully typed daily statistics query.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiQuery {
    /// Public object id of the resolved study.
    pub study_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub ordered_by: Field,
    pub order_direction: Direction,
    /// Patient ids to restrict to; `None` applies no subject filter.
    pub subject_ids: Option<Vec<String>>,
    /// Requested fields in canonical order.
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{name} is not recognized as an API parameter")]
    UnrecognizedParameter { name: String },
    #[error("the {param} parameter is required")]
    MissingRequired { param: &'static str },
    #[error("{}", invalid_choice_message(.param, .value))]
    InvalidChoice { param: &'static str, value: String },
    #[error("{}", invalid_format_message(.param))]
    InvalidFormat { param: &'static str, value: String },
}

fn invalid_choice_message(param: &str, value: &str) -> String {
    match param {
        STUDY_ID => "no study with that id was found".to_string(),
        ORDERED_BY => format!("{value} is not a field that can be used to sort the output"),
        ORDER_DIRECTION => "If provided, the order_direction parameter should contain either \
                            the value 'ascending' or 'descending'"
            .to_string(),
        _ => format!("{value} is not a valid field"),
    }
}

fn invalid_format_message(param: &str) -> String {
    match param {
        LIMIT => "limit value could not be interpreted as an integer value".to_string(),
        _ => format!(
            "{} could not be interpreted as a date. Dates should be formatted as \
             'mm/dd/yyyy' (without quotes)",
            param.replace('_', " ")
        ),
    }
}

/// Validation problems keyed by parameter name, `None` for problems with the
/// query as a whole. Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSet {
    entries: Vec<(Option<&'static str>, Vec<ValidationError>)>,
}

impl ErrorSet {
    pub fn add(&mut self, param: Option<&'static str>, error: ValidationError) {
        match self.entries.iter_mut().find(|(key, _)| *key == param) {
            Some((_, errors)) => errors.push(error),
            None => self.entries.push((param, vec![error])),
        }
    }

    pub fn merge(&mut self, other: ErrorSet) {
        for (param, errors) in other.entries {
            for error in errors {
                self.add(param, error);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of problems across all keys.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, errors)| errors.len()).sum()
    }

    pub fn get(&self, param: Option<&str>) -> &[ValidationError] {
        self.entries
            .iter()
            .find(|(key, _)| *key == param)
            .map(|(_, errors)| errors.as_slice())
            .unwrap_or(&[])
    }

    /// Every message, parameter errors first then whole-query errors. The
    /// parameter attribution is dropped.
    pub fn messages(&self) -> Vec<String> {
        let keyed = self.entries.iter().filter(|(key, _)| key.is_some());
        let whole = self.entries.iter().filter(|(key, _)| key.is_none());
        keyed
            .chain(whole)
            .flat_map(|(_, errors)| errors.iter().map(ToString::to_string))
            .collect()
    }
}

/// Validates raw parameters, collecting every problem before returning.
/// The outer result carries storage failures from the study lookup.
pub async fn validate(
    params: &RawParams,
    store: &dyn StatisticsStore,
) -> anyhow::Result<Result<ApiQuery, ErrorSet>> {
    let mut errors = ErrorSet::default();

    let study_id = match params.non_empty(STUDY_ID) {
        None => {
            errors.add(
                Some(STUDY_ID),
                ValidationError::MissingRequired { param: STUDY_ID },
            );
            None
        }
        Some(raw) => match store.find_study(raw).await? {
            Some(study) => Some(study.object_id),
            None => {
                errors.add(
                    Some(STUDY_ID),
                    ValidationError::InvalidChoice {
                        param: STUDY_ID,
                        value: raw.to_string(),
                    },
                );
                None
            }
        },
    };

    let end_date = clean_date(params, END_DATE, &mut errors);
    let start_date = clean_date(params, START_DATE, &mut errors);
    let limit = clean_limit(params, &mut errors);

    let ordered_by = match params.non_empty(ORDERED_BY) {
        None => Some(Field::Date),
        Some(raw) => match raw.parse::<Field>() {
            Ok(field) => Some(field),
            Err(_) => {
                errors.add(
                    Some(ORDERED_BY),
                    ValidationError::InvalidChoice {
                        param: ORDERED_BY,
                        value: raw.to_string(),
                    },
                );
                None
            }
        },
    };

    let order_direction = match params.non_empty(ORDER_DIRECTION) {
        None => Some(Direction::Descending),
        Some(raw) => match raw.parse::<Direction>() {
            Ok(direction) => Some(direction),
            Err(_) => {
                errors.add(
                    Some(ORDER_DIRECTION),
                    ValidationError::InvalidChoice {
                        param: ORDER_DIRECTION,
                        value: raw.to_string(),
                    },
                );
                None
            }
        },
    };

    let subject_ids = params.get(PARTICIPANT_IDS).and_then(split_csv);
    let fields = clean_fields(params, &mut errors);

    for name in params.names() {
        if !RECOGNIZED_PARAMETERS.contains(&name) {
            errors.add(
                None,
                ValidationError::UnrecognizedParameter {
                    name: name.to_string(),
                },
            );
        }
    }

    if !errors.is_empty() {
        return Ok(Err(errors));
    }

    match (study_id, ordered_by, order_direction) {
        (Some(study_id), Some(ordered_by), Some(order_direction)) => Ok(Ok(ApiQuery {
            study_id,
            start_date,
            end_date,
            limit,
            ordered_by,
            order_direction,
            subject_ids,
            fields,
        })),
        _ => anyhow::bail!("query validation produced no errors but left parameters unresolved"),
    }
}

fn clean_date(params: &RawParams, param: &'static str, errors: &mut ErrorSet) -> Option<NaiveDate> {
    let raw = params.non_empty(param)?;
    match parse_date(raw) {
        Some(date) => Some(date),
        None => {
            errors.add(
                Some(param),
                ValidationError::InvalidFormat {
                    param,
                    value: raw.to_string(),
                },
            );
            None
        }
    }
}

/// Strict `mm/dd/yyyy`. chrono's `%Y` alone accepts any number of year digits.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let digits = |part: &str, widths: RangeInclusive<usize>| {
        widths.contains(&part.len()) && part.bytes().all(|byte| byte.is_ascii_digit())
    };
    let mut parts = raw.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(month), Some(day), Some(year), None)
            if digits(month, 1..=2) && digits(day, 1..=2) && digits(year, 4..=4) =>
        {
            NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
        }
        _ => None,
    }
}

/// Bounded by `i64` so the value always fits a Postgres `LIMIT`.
fn clean_limit(params: &RawParams, errors: &mut ErrorSet) -> Option<usize> {
    let raw = params.non_empty(LIMIT)?;
    match raw
        .parse::<i64>()
        .ok()
        .and_then(|limit| usize::try_from(limit).ok())
    {
        Some(limit) => Some(limit),
        None => {
            errors.add(
                Some(LIMIT),
                ValidationError::InvalidFormat {
                    param: LIMIT,
                    value: raw.to_string(),
                },
            );
            None
        }
    }
}

/// Each bad entry gets its own error; an empty list means every field.
fn clean_fields(params: &RawParams, errors: &mut ErrorSet) -> Vec<Field> {
    let Some(entries) = params.get(FIELDS).and_then(split_csv) else {
        return Field::ALL.to_vec();
    };

    let mut selected = BTreeSet::new();
    for entry in entries {
        match entry.parse::<Field>() {
            Ok(field) => {
                selected.insert(field);
            }
            Err(_) => errors.add(
                Some(FIELDS),
                ValidationError::InvalidChoice {
                    param: FIELDS,
                    value: entry,
                },
            ),
        }
    }
    selected.into_iter().collect()
}

/// Splits a comma separated value. Blank input yields `None`, not an empty list.
fn split_csv(raw: &str) -> Option<Vec<String>> {
    let values: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}
