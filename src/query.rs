use std::cmp::Ordering;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::fields::Field;
use crate::form::ApiQuery;
use crate::models::SummaryStatisticDaily;
use crate::serialize::Directory;
use crate::store::{ResultSet, StatisticsStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order direction: {0}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ascending" => Ok(Direction::Ascending),
            "descending" => Ok(Direction::Descending),
            other => Err(UnknownDirection(other.to_string())),
        }
    }
}

/// A single row predicate. Identifiers are the public ones, each store
/// resolves them against its own keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Study(String),
    NotDeleted,
    SubjectIn(Vec<String>),
    DateOnOrBefore(NaiveDate),
    DateOnOrAfter(NaiveDate),
}

impl Filter {
    pub fn matches(&self, record: &SummaryStatisticDaily, directory: &Directory) -> bool {
        match self {
            Filter::Study(object_id) => {
                directory.study_object_id(record.study_id) == Some(object_id.as_str())
            }
            Filter::NotDeleted => !record.deleted,
            Filter::SubjectIn(patient_ids) => directory
                .patient_id(record.participant_id)
                .is_some_and(|patient_id| patient_ids.iter().any(|id| id == patient_id)),
            Filter::DateOnOrBefore(end) => record.date <= *end,
            Filter::DateOnOrAfter(start) => record.date >= *start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: Field,
    pub direction: Direction,
}

impl Sort {
    /// Orders by the sort field with the record id as tie breaker. A
    /// descending sort reverses the whole key, so the two directions always
    /// produce mirror images of each other.
    pub fn compare(&self, a: &SummaryStatisticDaily, b: &SummaryStatisticDaily) -> Ordering {
        let ordering = a
            .value(self.field)
            .sort_cmp(&b.value(self.field))
            .then(a.id.cmp(&b.id));
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Filters, then sort, then limit. Always applied in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub filters: Vec<Filter>,
    pub sort: Sort,
    pub limit: Option<usize>,
}

impl QueryPlan {
    pub fn study_object_id(&self) -> Option<&str> {
        self.filters.iter().find_map(|filter| match filter {
            Filter::Study(object_id) => Some(object_id.as_str()),
            _ => None,
        })
    }

    pub fn apply<'a, I>(&self, records: I, directory: &Directory) -> Vec<SummaryStatisticDaily>
    where
        I: IntoIterator<Item = &'a SummaryStatisticDaily>,
    {
        let mut selected: Vec<SummaryStatisticDaily> = records
            .into_iter()
            .filter(|record| self.filters.iter().all(|f| f.matches(record, directory)))
            .cloned()
            .collect();

        selected.sort_by(|a, b| self.sort.compare(a, b));

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }

        selected
    }
}

/// Builds the plan for a validated query. `fields` is left to the
/// serializer on purpose, filtering and projection stay independent.
pub fn translate(query: &ApiQuery) -> QueryPlan {
    let mut filters = vec![Filter::Study(query.study_id.clone()), Filter::NotDeleted];

    if let Some(subject_ids) = &query.subject_ids {
        filters.push(Filter::SubjectIn(subject_ids.clone()));
    }
    if let Some(end_date) = query.end_date {
        filters.push(Filter::DateOnOrBefore(end_date));
    }
    if let Some(start_date) = query.start_date {
        filters.push(Filter::DateOnOrAfter(start_date));
    }

    QueryPlan {
        filters,
        sort: Sort {
            field: query.ordered_by,
            direction: query.order_direction,
        },
        limit: query.limit,
    }
}

pub async fn execute(store: &dyn StatisticsStore, query: &ApiQuery) -> anyhow::Result<ResultSet> {
    let plan = translate(query);
    let result = store.execute(&plan).await?;
    tracing::debug!(
        study_id = %query.study_id,
        rows = result.records.len(),
        "executed daily statistics query"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;
    use crate::store::MemoryStore;

    fn day(month: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, month, d).unwrap()
    }

    fn base_query(study_id: &str) -> ApiQuery {
        ApiQuery {
            study_id: study_id.to_string(),
            start_date: None,
            end_date: None,
            limit: None,
            ordered_by: Field::Date,
            order_direction: Direction::Descending,
            subject_ids: None,
            fields: Field::ALL.to_vec(),
        }
    }

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::default();
        let study = store.add_study("study0000000000000000001", "Sleep Pilot");
        let other = store.add_study("study0000000000000000002", "Other");
        let alice = store.add_subject(&study, "alice001");
        let bob = store.add_subject(&study, "bob00002");
        let carol = store.add_subject(&other, "carol003");

        for (d, subject, steps) in [
            (1, &alice, 10),
            (2, &bob, 40),
            (3, &alice, 20),
            (4, &bob, 40),
            (5, &alice, 5),
        ] {
            store.add_record(subject, day(1, d), |record| {
                record.with_metric(Field::TotalUnlockEvents, Value::Integer(steps))
            });
        }
        store.add_record(&carol, day(1, 3), |record| record);
        let deleted = store.add_record(&alice, day(1, 6), |record| record);
        store.mark_deleted(deleted);
        store
    }

    async fn dates(store: &MemoryStore, query: &ApiQuery) -> Vec<NaiveDate> {
        execute(store, query)
            .await
            .unwrap()
            .records
            .iter()
            .map(|record| record.date)
            .collect()
    }

    #[test]
    fn translate_orders_filters_and_keeps_limit() {
        let mut query = base_query("abc");
        query.subject_ids = Some(vec!["p1".into()]);
        query.start_date = Some(day(1, 1));
        query.end_date = Some(day(2, 1));
        query.limit = Some(3);

        let plan = translate(&query);
        assert_eq!(
            plan.filters,
            vec![
                Filter::Study("abc".into()),
                Filter::NotDeleted,
                Filter::SubjectIn(vec!["p1".into()]),
                Filter::DateOnOrBefore(day(2, 1)),
                Filter::DateOnOrAfter(day(1, 1)),
            ]
        );
        assert_eq!(plan.limit, Some(3));
        assert_eq!(plan.study_object_id(), Some("abc"));
    }

    #[tokio::test]
    async fn scopes_to_study_and_hides_deleted_rows() {
        let store = sample_store();
        let found = dates(&store, &base_query("study0000000000000000001")).await;
        assert_eq!(
            found,
            vec![day(1, 5), day(1, 4), day(1, 3), day(1, 2), day(1, 1)]
        );
    }

    #[tokio::test]
    async fn ascending_is_the_exact_reverse_of_descending() {
        let store = sample_store();
        let mut query = base_query("study0000000000000000001");
        query.ordered_by = Field::TotalUnlockEvents;
        let descending = execute(&store, &query).await.unwrap().records;
        query.order_direction = Direction::Ascending;
        let mut ascending = execute(&store, &query).await.unwrap().records;

        ascending.reverse();
        assert_eq!(ascending, descending);
    }

    #[tokio::test]
    async fn date_order_reverses_exactly_with_same_day_rows() {
        let mut store = MemoryStore::default();
        let study = store.add_study("study0000000000000000001", "Sleep Pilot");
        let subjects = [
            store.add_subject(&study, "alice001"),
            store.add_subject(&study, "bob00002"),
            store.add_subject(&study, "carol003"),
        ];
        for d in [2, 1, 3] {
            for subject in &subjects {
                store.add_record(subject, day(1, d), |record| record);
            }
        }

        let mut query = base_query("study0000000000000000001");
        let descending = execute(&store, &query).await.unwrap().records;
        query.order_direction = Direction::Ascending;
        let mut ascending = execute(&store, &query).await.unwrap().records;

        assert_eq!(ascending.len(), 9);
        assert_eq!(ascending.first().map(|record| record.date), Some(day(1, 1)));
        ascending.reverse();
        assert_eq!(ascending, descending);
    }

    #[test]
    fn directions_parse_from_their_names() {
        assert_eq!("ascending".parse::<Direction>(), Ok(Direction::Ascending));
        assert_eq!("descending".parse::<Direction>(), Ok(Direction::Descending));
        assert_eq!(
            "up".parse::<Direction>(),
            Err(UnknownDirection("up".to_string()))
        );
    }

    #[tokio::test]
    async fn limit_keeps_the_head_of_the_sorted_rows() {
        let store = sample_store();
        let mut query = base_query("study0000000000000000001");
        query.order_direction = Direction::Ascending;
        query.limit = Some(2);
        assert_eq!(dates(&store, &query).await, vec![day(1, 1), day(1, 2)]);

        query.limit = Some(0);
        assert!(dates(&store, &query).await.is_empty());
    }

    #[tokio::test]
    async fn date_bounds_are_inclusive() {
        let store = sample_store();
        let mut query = base_query("study0000000000000000001");
        query.start_date = Some(day(1, 2));
        query.end_date = Some(day(1, 4));
        assert_eq!(
            dates(&store, &query).await,
            vec![day(1, 4), day(1, 3), day(1, 2)]
        );
    }

    #[tokio::test]
    async fn subject_filter_matches_patient_ids() {
        let store = sample_store();
        let mut query = base_query("study0000000000000000001");
        query.subject_ids = Some(vec!["bob00002".into(), "carol003".into()]);
        assert_eq!(dates(&store, &query).await, vec![day(1, 4), day(1, 2)]);
    }
}
