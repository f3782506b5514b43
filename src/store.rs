use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{Study, Subject, SummaryStatisticDaily};
use crate::query::QueryPlan;
use crate::serialize::Directory;

/// Records matching a plan, with the related objects needed to serialize them.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub records: Vec<SummaryStatisticDaily>,
    pub directory: Directory,
}

/// Read side of the summary statistics tables.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn find_study(&self, object_id: &str) -> anyhow::Result<Option<Study>>;

    async fn execute(&self, plan: &QueryPlan) -> anyhow::Result<ResultSet>;
}

/// A store held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    studies: Vec<Study>,
    subjects: Vec<Subject>,
    records: Vec<SummaryStatisticDaily>,
}

impl MemoryStore {
    pub fn add_study(&mut self, object_id: &str, name: &str) -> Study {
        let study = Study {
            id: self.studies.len() as i64 + 1,
            object_id: object_id.to_string(),
            name: name.to_string(),
        };
        self.studies.push(study.clone());
        study
    }

    pub fn add_subject(&mut self, study: &Study, patient_id: &str) -> Subject {
        let subject = Subject {
            id: self.subjects.len() as i64 + 1,
            patient_id: patient_id.to_string(),
            study_id: study.id,
        };
        self.subjects.push(subject.clone());
        subject
    }

    /// Adds a record for `subject` on `date`; `build` sets its metrics.
    /// Returns the new record id.
    pub fn add_record<F>(&mut self, subject: &Subject, date: NaiveDate, build: F) -> i64
    where
        F: FnOnce(SummaryStatisticDaily) -> SummaryStatisticDaily,
    {
        let id = self.records.len() as i64 + 1;
        let record = build(SummaryStatisticDaily::new(id, subject.id, subject.study_id, date));
        self.records.push(record);
        id
    }

    pub fn mark_deleted(&mut self, record_id: i64) -> bool {
        match self.records.iter_mut().find(|record| record.id == record_id) {
            Some(record) => {
                record.deleted = true;
                true
            }
            None => false,
        }
    }

    fn directory(&self) -> Directory {
        let mut directory = Directory::default();
        for study in &self.studies {
            directory.insert_study(study.clone());
        }
        for subject in &self.subjects {
            directory.insert_subject(subject.clone());
        }
        directory
    }
}

#[async_trait]
impl StatisticsStore for MemoryStore {
    async fn find_study(&self, object_id: &str) -> anyhow::Result<Option<Study>> {
        Ok(self
            .studies
            .iter()
            .find(|study| study.object_id == object_id)
            .cloned())
    }

    async fn execute(&self, plan: &QueryPlan) -> anyhow::Result<ResultSet> {
        let directory = self.directory();
        let records = plan.apply(&self.records, &directory);
        Ok(ResultSet { records, directory })
    }
}
