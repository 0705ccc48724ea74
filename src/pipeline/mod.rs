//! Ingestion pipeline: download orchestration, retry and backfill

mod backfill;
mod job;
mod orchestrator;
mod retry;

pub use backfill::*;
pub use job::*;
pub use orchestrator::{validate_range, BatchStats, CleanupStats, DownloadStatistics, Downloader};
pub use retry::*;

#[cfg(test)]
mod tests {
    use super::orchestrator::tests::{harness, mount_document};
    use crate::error::{Error, FailureKind};
    use crate::meta::RecordStore;
    use crate::state::{ProcessingRecord, ProcessingStatus};
    use chrono::NaiveDate;
    use tokio_util::sync::CancellationToken;

    async fn seed_failed(
        h: &super::orchestrator::tests::Harness,
        entity: &str,
        accession: &str,
        retry_count: u32,
    ) {
        let url = format!("{}/Archives/edgar/data/{}/{}.txt", h.server.uri(), entity, accession);
        let mut record = ProcessingRecord::new(
            accession,
            "4",
            entity,
            NaiveDate::from_ymd_opt(2024, 1, 2),
            url,
        );
        h.db.create_if_absent(&record).await.unwrap();
        record.mark_downloading().unwrap();
        h.db.update(&record, ProcessingStatus::Pending).await.unwrap();
        record.mark_failed(&Error::Other("connection reset".into())).unwrap();
        record.retry_count = retry_count;
        h.db.update(&record, ProcessingStatus::Downloading).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_respects_bound() {
        let h = harness(&["ownership"], |_| {}).await;
        seed_failed(&h, "1", "0000000001-24-000001", 2).await;
        seed_failed(&h, "2", "0000000002-24-000002", 3).await;
        mount_document(&h.server, "1", "0000000001-24-000001", "4").await;
        mount_document(&h.server, "2", "0000000002-24-000002", "4").await;

        let completed = h
            .downloader
            .retry_failed_downloads(3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completed, 1);

        let retried = h.db.find("0000000001-24-000001").await.unwrap().unwrap();
        assert_eq!(retried.status, ProcessingStatus::Completed);

        let exhausted = h.db.find("0000000002-24-000002").await.unwrap().unwrap();
        assert_eq!(exhausted.status, ProcessingStatus::Failed);
        assert_eq!(exhausted.retry_count, 3);

        let requests = h.server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_retry_is_counted_again() {
        let h = harness(&["ownership"], |_| {}).await;
        seed_failed(&h, "1", "0000000001-24-000001", 0).await;
        // No document mounted: the fetch 404s

        let stats = h
            .downloader
            .retry_failed_with_stats(3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.batch.failed, 1);

        let record = h.db.find("0000000001-24-000001").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.failure_kind, Some(FailureKind::Network));
    }
}
