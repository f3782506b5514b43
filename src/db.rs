use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::fields::{Field, FieldKind};
use crate::models::{Study, Subject, SummaryStatisticDaily, Value};
use crate::query::{Direction, Filter, QueryPlan};
use crate::serialize::Directory;
use crate::store::{ResultSet, StatisticsStore};

const SEED_STUDY_ID: &str = "8f0c2a51-6d3e-4b7a-9c1e-2f4d5b6a7c80";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Creates a study with a freshly generated public object id.
pub async fn create_study(pool: &PgPool, name: &str) -> anyhow::Result<Study> {
    let object_id = Uuid::new_v4().simple().to_string();
    upsert_study(pool, &object_id, name).await
}

async fn upsert_study(pool: &PgPool, object_id: &str, name: &str) -> anyhow::Result<Study> {
    let row = sqlx::query(
        r#"
        INSERT INTO studies (object_id, name)
        VALUES ($1, $2)
        ON CONFLICT (object_id) DO UPDATE SET name = EXCLUDED.name
        RETURNING id, object_id, name
        "#,
    )
    .bind(object_id)
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok(study_from_row(&row)?)
}

/// Returns the participant with `patient_id`, enrolling it in `study` when
/// it does not exist yet.
async fn ensure_participant(
    pool: &PgPool,
    study: &Study,
    patient_id: &str,
) -> anyhow::Result<Subject> {
    let row = sqlx::query(
        r#"
        INSERT INTO participants (patient_id, study_id)
        VALUES ($1, $2)
        ON CONFLICT (patient_id) DO UPDATE SET patient_id = EXCLUDED.patient_id
        RETURNING id, patient_id, study_id
        "#,
    )
    .bind(patient_id)
    .bind(study.id)
    .fetch_one(pool)
    .await?;

    let subject = subject_from_row(&row)?;
    if subject.study_id != study.id {
        bail!(
            "participant {patient_id} belongs to another study than {}",
            study.object_id
        );
    }
    Ok(subject)
}

/// Update-or-create on (participant, date). Null metrics are left untouched.
async fn upsert_statistic(
    pool: &PgPool,
    subject: &Subject,
    date: NaiveDate,
    metrics: &BTreeMap<Field, Value>,
) -> anyhow::Result<u64> {
    let present: Vec<(Field, &Value)> = metrics
        .iter()
        .filter(|(field, value)| field.is_metric() && **value != Value::Null)
        .map(|(field, value)| (*field, value))
        .collect();

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO summary_statistics_daily (participant_id, study_id, date",
    );
    for (field, _) in &present {
        builder.push(", ").push(field.column());
    }
    builder.push(") VALUES (");
    builder
        .push_bind(subject.id)
        .push(", ")
        .push_bind(subject.study_id)
        .push(", ")
        .push_bind(date);
    for (_, value) in &present {
        builder.push(", ");
        push_value(&mut builder, value);
    }
    builder.push(") ON CONFLICT (participant_id, date) DO ");
    if present.is_empty() {
        builder.push("NOTHING");
    } else {
        builder.push("UPDATE SET ");
        let mut assignments = builder.separated(", ");
        for (field, _) in &present {
            assignments.push(format_args!("{0} = EXCLUDED.{0}", field.column()));
        }
    }

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            builder.push("NULL");
        }
        Value::Boolean(flag) => {
            builder.push_bind(*flag);
        }
        Value::Integer(number) => {
            builder.push_bind(*number);
        }
        Value::Float(number) => {
            builder.push_bind(*number);
        }
        Value::Text(text) => {
            builder.push_bind(text.clone());
        }
        Value::Date(date) => {
            builder.push_bind(*date);
        }
        Value::DateTime(moment) => {
            builder.push_bind(*moment);
        }
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Study> {
    let study = upsert_study(pool, SEED_STUDY_ID, "Sleep and Mobility Pilot").await?;
    let patients = ["avery001", "jules002", "kiara003"];
    let first_day = NaiveDate::from_ymd_opt(2026, 1, 26).context("invalid date")?;

    for (index, patient_id) in patients.into_iter().enumerate() {
        let subject = ensure_participant(pool, &study, patient_id).await?;
        for offset in 0..7 {
            let date = first_day + Duration::days(offset);
            let base = (index as i64 + 1) * 10 + offset;
            let onset = date
                .and_hms_opt(22, (offset * 7 % 60) as u32, 0)
                .context("invalid time")?
                .and_utc();

            let mut metrics = BTreeMap::new();
            metrics.insert(Field::DistanceTravelled, Value::Float(base as f64 * 312.5));
            metrics.insert(Field::HomeDuration, Value::Float(14.0 + (offset as f64) / 2.0));
            metrics.insert(Field::SignificantLocationCount, Value::Integer(1 + offset % 4));
            metrics.insert(Field::TextOutgoingCount, Value::Integer(base));
            metrics.insert(Field::CallIncomingCount, Value::Integer(offset % 3));
            metrics.insert(Field::DeviceProximity, Value::Boolean(offset % 2 == 0));
            metrics.insert(Field::AccelerationDirection, Value::Text("forward".to_string()));
            metrics.insert(Field::TotalUnlockEvents, Value::Integer(40 + base));
            metrics.insert(Field::SleepDuration, Value::Integer(360 + offset * 15));
            metrics.insert(Field::SleepOnsetTime, Value::DateTime(onset));

            upsert_statistic(pool, &subject, date, &metrics).await?;
        }
    }

    info!(study_id = %study.object_id, participants = patients.len(), "seeded demo study");
    Ok(study)
}

/// One parsed row of a daily statistics CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvStatistic {
    pub patient_id: String,
    pub date: NaiveDate,
    pub metrics: BTreeMap<Field, Value>,
}

enum CsvColumn {
    PatientId,
    Date,
    Metric(Field),
}

/// Parses `patient_id`, `date` (yyyy-mm-dd) and metric columns. Blank cells
/// are nulls; any other column name is rejected.
pub fn parse_statistics_csv<R: Read>(source: R) -> anyhow::Result<Vec<CsvStatistic>> {
    let mut reader = csv::Reader::from_reader(source);
    let headers = reader.headers()?.clone();

    let mut columns = Vec::with_capacity(headers.len());
    for header in headers.iter() {
        let column = match header.trim() {
            "patient_id" => CsvColumn::PatientId,
            "date" => CsvColumn::Date,
            name => match name.parse::<Field>() {
                Ok(field) if field.is_metric() => CsvColumn::Metric(field),
                _ => bail!("unknown column '{name}'"),
            },
        };
        columns.push(column);
    }
    if !columns.iter().any(|c| matches!(c, CsvColumn::PatientId)) {
        bail!("missing patient_id column");
    }
    if !columns.iter().any(|c| matches!(c, CsvColumn::Date)) {
        bail!("missing date column");
    }

    let mut statistics = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let line = index + 2;
        let record = result.with_context(|| format!("line {line}"))?;

        let mut patient_id = None;
        let mut date = None;
        let mut metrics = BTreeMap::new();
        for (column, raw) in columns.iter().zip(record.iter()) {
            let raw = raw.trim();
            match column {
                CsvColumn::PatientId => patient_id = Some(raw.to_string()),
                CsvColumn::Date => {
                    date = Some(
                        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                            .with_context(|| format!("line {line}: invalid date '{raw}'"))?,
                    )
                }
                CsvColumn::Metric(field) => {
                    let value = parse_cell(*field, raw)
                        .with_context(|| format!("line {line}: invalid {field} '{raw}'"))?;
                    if value != Value::Null {
                        metrics.insert(*field, value);
                    }
                }
            }
        }

        let patient_id = patient_id
            .filter(|id| !id.is_empty())
            .with_context(|| format!("line {line}: missing patient_id"))?;
        let date = date.with_context(|| format!("line {line}: missing date"))?;
        statistics.push(CsvStatistic {
            patient_id,
            date,
            metrics,
        });
    }

    Ok(statistics)
}

fn parse_cell(field: Field, raw: &str) -> anyhow::Result<Value> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    let value = match field.kind() {
        FieldKind::Float => Value::Float(raw.parse()?),
        FieldKind::Integer => Value::Integer(raw.parse()?),
        FieldKind::Text => Value::Text(raw.to_string()),
        FieldKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Value::Boolean(true),
            "false" | "f" | "0" => Value::Boolean(false),
            other => bail!("'{other}' is not a boolean"),
        },
        FieldKind::DateTime => {
            Value::DateTime(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
        }
        FieldKind::Date | FieldKind::Relation => bail!("{field} is not a metric"),
    };
    Ok(value)
}

pub async fn import_csv(
    pool: &PgPool,
    csv_path: &std::path::Path,
    study_object_id: &str,
) -> anyhow::Result<usize> {
    let store = PgStore::new(pool.clone());
    let study = store
        .find_study(study_object_id)
        .await?
        .with_context(|| format!("no study with object id {study_object_id}"))?;

    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let statistics = parse_statistics_csv(file)?;

    let mut written = 0usize;
    for row in statistics {
        let subject = ensure_participant(pool, &study, &row.patient_id).await?;
        if upsert_statistic(pool, &subject, row.date, &row.metrics).await? > 0 {
            written += 1;
        }
    }

    Ok(written)
}

/// Marks every record of a participant deleted. Returns the number of rows
/// flipped.
pub async fn delete_participant(pool: &PgPool, patient_id: &str) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE summary_statistics_daily
        SET deleted = TRUE
        WHERE NOT deleted
          AND participant_id = (SELECT id FROM participants WHERE patient_id = $1)
        "#,
    )
    .bind(patient_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Postgres backed `StatisticsStore`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_directory(&self, study: Study) -> anyhow::Result<Directory> {
        let rows = sqlx::query("SELECT id, patient_id, study_id FROM participants WHERE study_id = $1")
            .bind(study.id)
            .fetch_all(&self.pool)
            .await?;

        let mut directory = Directory::default();
        for row in rows {
            directory.insert_subject(subject_from_row(&row)?);
        }
        directory.insert_study(study);
        Ok(directory)
    }
}

#[async_trait]
impl StatisticsStore for PgStore {
    async fn find_study(&self, object_id: &str) -> anyhow::Result<Option<Study>> {
        let row = sqlx::query("SELECT id, object_id, name FROM studies WHERE object_id = $1")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up study")?;

        Ok(row.as_ref().map(study_from_row).transpose()?)
    }

    async fn execute(&self, plan: &QueryPlan) -> anyhow::Result<ResultSet> {
        let study = match plan.study_object_id() {
            Some(object_id) => self.find_study(object_id).await?,
            None => None,
        };
        let Some(study) = study else {
            return Ok(ResultSet::default());
        };
        let directory = self.load_directory(study).await?;

        let rows = build_select(plan)
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to query daily statistics")?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResultSet { records, directory })
    }
}

fn build_select(plan: &QueryPlan) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT s.* FROM summary_statistics_daily s \
         JOIN studies st ON st.id = s.study_id \
         JOIN participants p ON p.id = s.participant_id",
    );

    if !plan.filters.is_empty() {
        builder.push(" WHERE ");
        let mut conditions = builder.separated(" AND ");
        for filter in &plan.filters {
            match filter {
                Filter::Study(object_id) => {
                    conditions.push("st.object_id = ");
                    conditions.push_bind_unseparated(object_id.clone());
                }
                Filter::NotDeleted => {
                    conditions.push("NOT s.deleted");
                }
                Filter::SubjectIn(patient_ids) => {
                    conditions.push("p.patient_id = ANY(");
                    conditions.push_bind_unseparated(patient_ids.clone());
                    conditions.push_unseparated(")");
                }
                Filter::DateOnOrBefore(end) => {
                    conditions.push("s.date <= ");
                    conditions.push_bind_unseparated(*end);
                }
                Filter::DateOnOrAfter(start) => {
                    conditions.push("s.date >= ");
                    conditions.push_bind_unseparated(*start);
                }
            }
        }
    }

    let direction = match plan.sort.direction {
        Direction::Ascending => "ASC",
        Direction::Descending => "DESC",
    };
    builder.push(format_args!(
        " ORDER BY s.{} {direction}, s.id {direction}",
        plan.sort.field.column()
    ));

    if let Some(limit) = plan.limit {
        builder.push(" LIMIT ").push_bind(limit_bind(limit));
    }

    builder
}

/// Saturates rather than wrapping into a negative `LIMIT`.
fn limit_bind(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn study_from_row(row: &PgRow) -> Result<Study, sqlx::Error> {
    Ok(Study {
        id: row.try_get("id")?,
        object_id: row.try_get("object_id")?,
        name: row.try_get("name")?,
    })
}

fn subject_from_row(row: &PgRow) -> Result<Subject, sqlx::Error> {
    Ok(Subject {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        study_id: row.try_get("study_id")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<SummaryStatisticDaily, sqlx::Error> {
    let mut record = SummaryStatisticDaily::new(
        row.try_get("id")?,
        row.try_get("participant_id")?,
        row.try_get("study_id")?,
        row.try_get("date")?,
    );
    record.deleted = row.try_get("deleted")?;

    for field in Field::metrics() {
        let column = field.column();
        let value = match field.kind() {
            FieldKind::Float => row.try_get::<Option<f64>, _>(column)?.map(Value::Float),
            FieldKind::Integer | FieldKind::Relation => {
                row.try_get::<Option<i64>, _>(column)?.map(Value::Integer)
            }
            FieldKind::Text => row.try_get::<Option<String>, _>(column)?.map(Value::Text),
            FieldKind::Boolean => row.try_get::<Option<bool>, _>(column)?.map(Value::Boolean),
            FieldKind::Date => row.try_get::<Option<NaiveDate>, _>(column)?.map(Value::Date),
            FieldKind::DateTime => row
                .try_get::<Option<DateTime<Utc>>, _>(column)?
                .map(Value::DateTime),
        };
        if let Some(value) = value {
            record.metrics.insert(field, value);
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Sort;

    #[test]
    fn select_applies_filters_then_sort_then_limit() {
        let plan = QueryPlan {
            filters: vec![
                Filter::Study("abc".into()),
                Filter::NotDeleted,
                Filter::SubjectIn(vec!["p1".into()]),
                Filter::DateOnOrBefore(NaiveDate::from_ymd_opt(2022, 12, 31).unwrap()),
                Filter::DateOnOrAfter(NaiveDate::from_ymd_opt(2022, 1, 1).unwrap()),
            ],
            sort: Sort {
                field: Field::SleepDuration,
                direction: Direction::Descending,
            },
            limit: Some(2),
        };

        let builder = build_select(&plan);
        assert_eq!(
            builder.sql(),
            "SELECT s.* FROM summary_statistics_daily s \
             JOIN studies st ON st.id = s.study_id \
             JOIN participants p ON p.id = s.participant_id \
             WHERE st.object_id = $1 AND NOT s.deleted AND p.patient_id = ANY($2) \
             AND s.date <= $3 AND s.date >= $4 \
             ORDER BY s.sleep_duration DESC, s.id DESC LIMIT $5"
        );
    }

    #[test]
    fn oversized_limits_bind_as_the_largest_bigint() {
        assert_eq!(limit_bind(0), 0);
        assert_eq!(limit_bind(25), 25);
        assert_eq!(limit_bind(usize::MAX), i64::MAX);
    }

    #[test]
    fn select_sorts_relations_by_foreign_key() {
        let plan = QueryPlan {
            filters: vec![Filter::Study("abc".into())],
            sort: Sort {
                field: Field::Participant,
                direction: Direction::Ascending,
            },
            limit: None,
        };

        assert!(build_select(&plan)
            .sql()
            .ends_with("WHERE st.object_id = $1 ORDER BY s.participant_id ASC, s.id ASC"));
    }

    #[test]
    fn csv_rows_parse_into_typed_metrics() {
        let data = "patient_id,date,sleep_duration,home_duration,device_proximity,sleep_onset_time\n\
                    abc12345,2022-03-01,420,13.5,true,2022-03-01T23:00:00+01:00\n\
                    abc12345,2022-03-02,,,,\n";

        let rows = parse_statistics_csv(data.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].patient_id, "abc12345");
        assert_eq!(rows[0].metrics[&Field::SleepDuration], Value::Integer(420));
        assert_eq!(rows[0].metrics[&Field::HomeDuration], Value::Float(13.5));
        assert_eq!(rows[0].metrics[&Field::DeviceProximity], Value::Boolean(true));
        let onset = DateTime::parse_from_rfc3339("2022-03-01T22:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(rows[0].metrics[&Field::SleepOnsetTime], Value::DateTime(onset));
        assert!(rows[1].metrics.is_empty());
    }

    #[test]
    fn csv_rejects_unknown_columns() {
        let err = parse_statistics_csv("patient_id,date,steps\np1,2022-01-01,3\n".as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("unknown column 'steps'"));

        let err = parse_statistics_csv("patient_id,study\np1,x\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown column 'study'"));
    }

    #[test]
    fn csv_reports_the_offending_line() {
        let err = parse_statistics_csv("patient_id,date,sleep_duration\np1,2022-01-01,lots\n".as_bytes())
            .unwrap_err();
        assert!(err.to_string().starts_with("line 2: invalid sleep_duration 'lots'"));
    }

    #[test]
    fn cells_parse_by_field_kind() {
        assert_eq!(parse_cell(Field::TextReciprocity, "3").unwrap(), Value::Integer(3));
        assert_eq!(
            parse_cell(Field::StationaryFraction, "0.4").unwrap(),
            Value::Text("0.4".into())
        );
        assert_eq!(parse_cell(Field::DeviceProximity, "F").unwrap(), Value::Boolean(false));
        assert_eq!(parse_cell(Field::RadiusOfGyration, "").unwrap(), Value::Null);
        assert!(parse_cell(Field::DeviceProximity, "maybe").is_err());
        assert!(parse_cell(Field::Date, "2022-01-01").is_err());
    }
}
