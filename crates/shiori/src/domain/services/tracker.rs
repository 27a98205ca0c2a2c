use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    domain::{
        entities::{chapter::ReaderChapter, tracker::SyncRecord},
        repositories::tracker::{SyncRecordRepository, TrackerRepositoryError},
    },
    infrastructure::tracker::SyncManager,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("repository error: {0}")]
    RepositoryError(#[from] TrackerRepositoryError),
}

/// Chapter number to report to sync services, bumping and flagging every
/// record that is behind it. Returns 0 when no record needs an update.
pub fn chapter_to_update(
    current: &ReaderChapter,
    previous: Option<&ReaderChapter>,
    records: &mut [SyncRecord],
) -> i64 {
    if records.is_empty() {
        return 0;
    }

    let last_chapter_read = if current.read {
        current.chapter().number.floor() as i64
    } else {
        match previous {
            Some(previous) if previous.read => previous.chapter().number.floor() as i64,
            _ => 0,
        }
    };

    for record in records.iter_mut() {
        if last_chapter_read > record.last_chapter_read {
            record.last_chapter_read = last_chapter_read;
            record.update = true;
        }
    }

    if records.iter().any(|record| record.update) {
        last_chapter_read
    } else {
        0
    }
}

#[derive(Clone)]
pub struct SyncService<R>
where
    R: SyncRecordRepository + Clone + 'static,
{
    repo: R,
    senders: SyncManager,
}

impl<R> SyncService<R>
where
    R: SyncRecordRepository + Clone + 'static,
{
    pub fn new(repo: R, senders: SyncManager) -> Self {
        Self { repo, senders }
    }

    pub async fn get_sync_records(&self, manga_id: i64) -> Result<Vec<SyncRecord>, TrackerError> {
        Ok(self.repo.get_sync_records_by_manga_id(manga_id).await?)
    }

    /// Push flagged records to their sync service, then store them. Failures
    /// are logged and do not affect the other records.
    pub fn update_last_chapter_read(&self, records: Vec<SyncRecord>) -> Vec<JoinHandle<()>> {
        records
            .into_iter()
            .filter(|record| record.update)
            .filter_map(|mut record| {
                let Some(sender) = self.senders.get(record.sync_id) else {
                    debug!("no sync service {} for manga {}", record.sync_id, record.manga_id);
                    return None;
                };
                if !sender.is_logged_in() {
                    debug!("sync service {} is not logged in", record.sync_id);
                    return None;
                }

                let repo = self.repo.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = sender.update(&record).await {
                        error!("error updating {} on sync service {}: {e}", record.title, record.sync_id);
                        return;
                    }

                    record.update = false;
                    if let Err(e) = repo.update_sync_record(&record).await {
                        error!("error saving sync record {}: {e}", record.id);
                    }
                }))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::domain::{entities::chapter::Chapter, repositories::tracker::SyncSender};
    use async_trait::async_trait;

    fn reader_chapter(number: f64, read: bool) -> ReaderChapter {
        let mut chapter = ReaderChapter::new(Chapter {
            number,
            ..Default::default()
        });
        chapter.read = read;
        chapter
    }

    fn record(id: i64, sync_id: i64, last_chapter_read: i64) -> SyncRecord {
        SyncRecord {
            id,
            manga_id: 1,
            sync_id,
            title: format!("record {id}"),
            last_chapter_read,
            ..Default::default()
        }
    }

    #[test]
    fn test_chapter_to_update_uses_floor() {
        let mut records = vec![record(1, 1, 3), record(2, 2, 20)];
        let current = reader_chapter(12.5, true);

        assert_eq!(chapter_to_update(&current, None, &mut records), 12);
        assert_eq!(records[0].last_chapter_read, 12);
        assert!(records[0].update);
        assert_eq!(records[1].last_chapter_read, 20);
        assert!(!records[1].update);
    }

    #[test]
    fn test_chapter_to_update_falls_back_to_previous() {
        let current = reader_chapter(8.0, false);
        let previous = reader_chapter(7.2, true);

        let mut records = vec![record(1, 1, 0)];
        assert_eq!(chapter_to_update(&current, Some(&previous), &mut records), 7);

        let mut records = vec![record(1, 1, 0)];
        let unread = reader_chapter(7.0, false);
        assert_eq!(chapter_to_update(&current, Some(&unread), &mut records), 0);
        assert!(!records[0].update);

        let mut records = vec![record(1, 1, 9)];
        assert_eq!(chapter_to_update(&current, Some(&previous), &mut records), 0);

        assert_eq!(chapter_to_update(&current, Some(&previous), &mut []), 0);
    }

    #[derive(Clone, Default)]
    struct MemoryRepo {
        saved: Arc<Mutex<Vec<SyncRecord>>>,
    }

    #[async_trait]
    impl SyncRecordRepository for MemoryRepo {
        async fn get_sync_records_by_manga_id(
            &self,
            manga_id: i64,
        ) -> Result<Vec<SyncRecord>, TrackerRepositoryError> {
            Ok(self
                .saved
                .lock()
                .expect("lock")
                .iter()
                .filter(|record| record.manga_id == manga_id)
                .cloned()
                .collect())
        }

        async fn update_sync_record(&self, record: &SyncRecord) -> Result<(), TrackerRepositoryError> {
            self.saved.lock().expect("lock").push(record.clone());
            Ok(())
        }
    }

    struct FakeSender {
        id: i64,
        logged_in: bool,
        fail: bool,
        updates: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SyncSender for FakeSender {
        fn id(&self) -> i64 {
            self.id
        }

        fn is_logged_in(&self) -> bool {
            self.logged_in
        }

        async fn update(&self, record: &SyncRecord) -> Result<(), anyhow::Error> {
            if self.fail {
                anyhow::bail!("remote rejected update");
            }
            self.updates.lock().expect("lock").push(record.last_chapter_read);
            Ok(())
        }
    }

    fn sender(id: i64, logged_in: bool, fail: bool) -> Arc<FakeSender> {
        Arc::new(FakeSender {
            id,
            logged_in,
            fail,
            updates: Mutex::new(vec![]),
        })
    }

    #[tokio::test]
    async fn test_update_only_logged_in_senders() {
        let senders = SyncManager::new();
        let online = sender(1, true, false);
        let offline = sender(2, false, false);
        let failing = sender(3, true, true);
        senders.register(online.clone());
        senders.register(offline.clone());
        senders.register(failing.clone());

        let repo = MemoryRepo::default();
        let service = SyncService::new(repo.clone(), senders);

        let mut records = vec![
            record(1, 1, 0),
            record(2, 2, 0),
            record(3, 3, 0),
            record(4, 4, 0),
            record(5, 1, 50),
        ];
        assert_eq!(
            chapter_to_update(&reader_chapter(10.0, true), None, &mut records),
            10
        );

        let handles = service.update_last_chapter_read(records);
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.expect("join");
        }

        assert_eq!(*online.updates.lock().expect("lock"), vec![10]);
        assert!(offline.updates.lock().expect("lock").is_empty());

        let saved = service.get_sync_records(1).await.expect("records");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, 1);
        assert!(!saved[0].update);
    }
}
