//! Read-only rollups for the teacher dashboard.

use crate::curriculum::CurriculumCounts;
use crate::error::Result;
use crate::progress::{ProgressStore, Status};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDistribution {
    pub not_started: usize,
    pub red: usize,
    pub yellow: usize,
    pub green: usize,
}

impl StatusDistribution {
    fn add(&mut self, status: Status) {
        match status {
            Status::NotStarted => self.not_started += 1,
            Status::Red => self.red += 1,
            Status::Yellow => self.yellow += 1,
            Status::Green => self.green += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementSummary {
    /// Students with at least one progress record or an active session.
    pub active_students: usize,
    pub total_sessions: usize,
    pub by_status_distribution: StatusDistribution,
    pub flagged_records: usize,
    pub average_sessions_per_student: f64,
}

/// Engagement figures plus the size of the curriculum they were taken against.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    #[serde(flatten)]
    pub engagement: EngagementSummary,
    pub curriculum: CurriculumCounts,
}

pub struct AnalyticsAggregator {
    progress: Arc<dyn ProgressStore>,
}

impl AnalyticsAggregator {
    pub fn new(progress: Arc<dyn ProgressStore>) -> Self {
        Self { progress }
    }

    /// Reads are not taken under one snapshot; figures may lag concurrent writes.
    pub async fn engagement_summary(&self) -> Result<EngagementSummary> {
        let records = self.progress.list_all().await?;
        let active_sessions = self.progress.list_active_sessions().await?;
        let total_sessions = self.progress.count_sessions().await?;

        let mut distribution = StatusDistribution::default();
        let mut students: HashSet<&str> = HashSet::new();
        for record in &records {
            distribution.add(record.status);
            students.insert(&record.student_id);
        }
        students.extend(active_sessions.iter().map(|s| s.student_id.as_str()));

        let active_students = students.len();
        let average_sessions_per_student = if active_students == 0 {
            0.0
        } else {
            total_sessions as f64 / active_students as f64
        };

        Ok(EngagementSummary {
            active_students,
            total_sessions,
            by_status_distribution: distribution,
            flagged_records: records.iter().filter(|r| r.flagged).count(),
            average_sessions_per_student,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryProgressStore;
    use crate::session::Session;
    use chrono::Utc;

    #[tokio::test]
    async fn test_empty_store() {
        let aggregator = AnalyticsAggregator::new(Arc::new(InMemoryProgressStore::new()));
        let summary = aggregator.engagement_summary().await.unwrap();
        assert_eq!(summary.active_students, 0);
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.average_sessions_per_student, 0.0);
    }

    #[tokio::test]
    async fn test_rollup_over_records_and_sessions() {
        let store = Arc::new(InMemoryProgressStore::new());
        store.upsert("ana", 1, Status::Green, false).await.unwrap();
        store.upsert("ana", 2, Status::Yellow, true).await.unwrap();
        store.upsert("ben", 1, Status::Red, false).await.unwrap();
        for student in ["ana", "ben", "cy", "cy"] {
            store
                .insert_session(&Session::new(student, 1, Utc::now()))
                .await
                .unwrap();
        }

        let summary = AnalyticsAggregator::new(store)
            .engagement_summary()
            .await
            .unwrap();
        assert_eq!(summary.active_students, 3);
        assert_eq!(summary.total_sessions, 4);
        assert_eq!(
            summary.by_status_distribution,
            StatusDistribution {
                not_started: 0,
                red: 1,
                yellow: 1,
                green: 1,
            }
        );
        assert_eq!(summary.flagged_records, 1);
        assert!((summary.average_sessions_per_student - 4.0 / 3.0).abs() < 1e-9);
    }
}
