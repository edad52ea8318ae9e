use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::archive::{message_ids, ArchiveStore, Message};
use crate::telegram::{RawUpdate, SkipReason, UpdateSource};

/// Outcome of one fetch-and-merge pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub new_count: usize,
    pub cursor_advanced: bool,
    /// Cursor after the run
    pub cursor: Option<i64>,
}

impl RunResult {
    /// Whether anything was written to the store
    pub fn changed(&self) -> bool {
        self.new_count > 0 || self.cursor_advanced
    }
}

/// Pulls new updates into the archive.
///
/// Each run reads the cursor, requests updates from there, merges the
/// usable messages into the log without duplicates, and moves the cursor
/// past every update it saw. Nothing is written unless the fetch succeeded.
pub struct Fetcher<S> {
    source: S,
    store: ArchiveStore,
    channel_filter: Option<i64>,
}

impl<S: UpdateSource> Fetcher<S> {
    pub fn new(source: S, store: ArchiveStore, channel_filter: Option<i64>) -> Self {
        Self {
            source,
            store,
            channel_filter,
        }
    }

    pub async fn run(&self) -> Result<RunResult> {
        let prior_cursor = self.store.load_cursor();

        let updates = self
            .source
            .get_updates(prior_cursor)
            .await
            .context("Failed to get updates")?;

        if updates.is_empty() {
            info!("No new updates");
            return Ok(RunResult {
                new_count: 0,
                cursor_advanced: false,
                cursor: prior_cursor,
            });
        }

        let mut messages = self.store.load_log();
        let mut seen = message_ids(&messages);
        let processed_at = Utc::now().to_rfc3339();

        let mut new_count = 0;
        let mut max_seen: Option<i64> = None;

        for update in &updates {
            // Every update moves the cursor, usable or not
            max_seen = Some(max_seen.map_or(update.update_id, |m| m.max(update.update_id)));

            match self.accept(update, &seen, &processed_at) {
                Ok(message) => {
                    seen.insert(message.message_id);
                    messages.push(message);
                    new_count += 1;
                }
                Err(reason) => debug!("Skipping update {}: {}", update.update_id, reason),
            }
        }

        if new_count > 0 {
            messages.sort_by_key(|m| m.timestamp);
            self.store.save_log(&messages)?;
            info!(
                "Added {} new messages ({} archived)",
                new_count,
                messages.len()
            );
        }

        let mut cursor = prior_cursor;
        let mut cursor_advanced = false;
        if let Some(max_seen) = max_seen {
            // Offsets are inclusive, so resume one past the highest id consumed
            let next = max_seen + 1;
            if prior_cursor.map_or(true, |prior| next > prior) {
                self.store.save_cursor(next)?;
                info!("Updated cursor to {}", next);
                cursor = Some(next);
                cursor_advanced = true;
            }
        }

        Ok(RunResult {
            new_count,
            cursor_advanced,
            cursor,
        })
    }

    fn accept(
        &self,
        update: &RawUpdate,
        seen: &HashSet<i64>,
        processed_at: &str,
    ) -> Result<Message, SkipReason> {
        let payload = update.payload().ok_or(SkipReason::NoPayload)?;
        let message = payload.normalize(self.channel_filter, processed_at)?;
        if seen.contains(&message.message_id) {
            return Err(SkipReason::Duplicate(message.message_id));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::UpstreamError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory update stream
    struct FakeSource {
        updates: Vec<RawUpdate>,
        honor_offset: bool,
        fail: bool,
        requested: Mutex<Vec<Option<i64>>>,
    }

    impl FakeSource {
        fn stream(updates: Vec<RawUpdate>) -> Self {
            Self {
                updates,
                honor_offset: true,
                fail: false,
                requested: Mutex::new(Vec::new()),
            }
        }

        fn fixed(updates: Vec<RawUpdate>) -> Self {
            Self {
                honor_offset: false,
                ..Self::stream(updates)
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::stream(Vec::new())
            }
        }

        fn requested(&self) -> Vec<Option<i64>> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateSource for FakeSource {
        async fn get_updates(
            &self,
            offset: Option<i64>,
        ) -> Result<Vec<RawUpdate>, UpstreamError> {
            self.requested.lock().unwrap().push(offset);
            if self.fail {
                return Err(UpstreamError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "upstream down".to_string(),
                });
            }
            Ok(self
                .updates
                .iter()
                .filter(|u| !self.honor_offset || offset.map_or(true, |o| u.update_id >= o))
                .cloned()
                .collect())
        }
    }

    fn text_update(
        update_id: i64,
        message_id: i64,
        chat_id: i64,
        text: &str,
        date: i64,
    ) -> RawUpdate {
        serde_json::from_value(json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": {"id": chat_id, "type": "group"},
                "from": {"id": 9, "is_bot": false, "first_name": "A"},
                "text": text,
                "date": date
            }
        }))
        .unwrap()
    }

    fn photo_update(update_id: i64, message_id: i64) -> RawUpdate {
        serde_json::from_value(json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": {"id": 5},
                "from": {"id": 9, "first_name": "A"},
                "photo": [{"file_id": "x"}],
                "date": 1000
            }
        }))
        .unwrap()
    }

    fn temp_store() -> (ArchiveStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(
            dir.path().join("data").join("messages.json"),
            dir.path().join("data").join("last_update_id.txt"),
        );
        (store, dir)
    }

    fn seeded_message(message_id: i64, timestamp: i64) -> Message {
        Message {
            message_id,
            chat_id: 5,
            sender_id: Some(9),
            sender_name: "A".to_string(),
            text: "existing".to_string(),
            timestamp,
            processed_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn assert_sorted(messages: &[Message]) {
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[tokio::test]
    async fn test_first_run_archives_message() {
        let (store, _dir) = temp_store();
        let source = FakeSource::stream(vec![text_update(100, 1, 5, "hi", 1000)]);
        let fetcher = Fetcher::new(source, store.clone(), None);

        let result = fetcher.run().await.unwrap();

        assert_eq!(
            result,
            RunResult {
                new_count: 1,
                cursor_advanced: true,
                cursor: Some(101)
            }
        );
        let log = store.load_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message_id, 1);
        assert_eq!(log[0].chat_id, 5);
        assert_eq!(log[0].sender_id, Some(9));
        assert_eq!(log[0].sender_name, "A");
        assert_eq!(log[0].text, "hi");
        assert_eq!(log[0].timestamp, 1000);
        assert!(chrono::DateTime::parse_from_rfc3339(&log[0].processed_at).is_ok());
        assert_eq!(store.load_cursor(), Some(101));
        assert_eq!(fetcher.source.requested(), vec![None]);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_not_duplicated() {
        let (store, _dir) = temp_store();
        store.save_log(&[seeded_message(1, 1000)]).unwrap();
        let before = std::fs::read_to_string(store.messages_path()).unwrap();

        let source = FakeSource::stream(vec![text_update(100, 1, 5, "hi", 1000)]);
        let result = Fetcher::new(source, store.clone(), None).run().await.unwrap();

        assert_eq!(result.new_count, 0);
        assert!(result.cursor_advanced);
        assert_eq!(store.load_cursor(), Some(101));
        assert_eq!(std::fs::read_to_string(store.messages_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_other_chat_is_skipped_but_consumed() {
        let (store, _dir) = temp_store();
        let source = FakeSource::stream(vec![text_update(100, 1, 7, "hi", 1000)]);

        let result = Fetcher::new(source, store.clone(), Some(5))
            .run()
            .await
            .unwrap();

        assert_eq!(result.new_count, 0);
        assert_eq!(result.cursor, Some(101));
        assert!(!store.messages_path().exists());
        assert_eq!(store.load_cursor(), Some(101));
    }

    #[tokio::test]
    async fn test_upstream_failure_writes_nothing() {
        let (store, _dir) = temp_store();
        let fetcher = Fetcher::new(FakeSource::failing(), store.clone(), None);

        let err = fetcher.run().await.unwrap_err();

        assert!(err.downcast_ref::<UpstreamError>().is_some());
        assert!(!store.messages_path().exists());
        assert!(!store.cursor_path().exists());
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_existing_state() {
        let (store, _dir) = temp_store();
        store.save_log(&[seeded_message(1, 1000)]).unwrap();
        store.save_cursor(50).unwrap();
        let log_before = std::fs::read_to_string(store.messages_path()).unwrap();

        let fetcher = Fetcher::new(FakeSource::failing(), store.clone(), None);
        assert!(fetcher.run().await.is_err());

        assert_eq!(fetcher.source.requested(), vec![Some(50)]);
        assert_eq!(
            std::fs::read_to_string(store.messages_path()).unwrap(),
            log_before
        );
        assert_eq!(
            std::fs::read_to_string(store.cursor_path()).unwrap(),
            "50"
        );
    }

    #[tokio::test]
    async fn test_second_run_without_new_data_is_noop() {
        let (store, _dir) = temp_store();
        let source = FakeSource::stream(vec![
            text_update(100, 1, 5, "hi", 1000),
            text_update(101, 2, 5, "there", 1001),
        ]);
        let fetcher = Fetcher::new(source, store.clone(), None);

        let first = fetcher.run().await.unwrap();
        let log_after_first = std::fs::read_to_string(store.messages_path()).unwrap();
        let second = fetcher.run().await.unwrap();

        assert_eq!(first.new_count, 2);
        assert_eq!(
            second,
            RunResult {
                new_count: 0,
                cursor_advanced: false,
                cursor: Some(102)
            }
        );
        assert!(!second.changed());
        assert_eq!(fetcher.source.requested(), vec![None, Some(102)]);
        assert_eq!(
            std::fs::read_to_string(store.messages_path()).unwrap(),
            log_after_first
        );
        assert_eq!(store.load_cursor(), Some(102));
    }

    #[tokio::test]
    async fn test_log_is_sorted_by_timestamp() {
        let (store, _dir) = temp_store();
        store
            .save_log(&[seeded_message(10, 500), seeded_message(11, 2500)])
            .unwrap();
        let source = FakeSource::stream(vec![
            text_update(1, 20, 5, "late", 3000),
            text_update(2, 21, 5, "early", 100),
            text_update(3, 22, 5, "middle", 1500),
        ]);

        Fetcher::new(source, store.clone(), None).run().await.unwrap();

        let log = store.load_log();
        assert_sorted(&log);
        let ids: Vec<i64> = log.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![21, 10, 22, 11, 20]);
    }

    #[tokio::test]
    async fn test_skips_only_batch_advances_cursor_without_log_write() {
        let (store, _dir) = temp_store();
        let bare: RawUpdate = serde_json::from_value(json!({"update_id": 42})).unwrap();
        let source = FakeSource::stream(vec![
            photo_update(40, 1),
            text_update(41, 2, 7, "elsewhere", 1000),
            bare,
        ]);

        let result = Fetcher::new(source, store.clone(), Some(5))
            .run()
            .await
            .unwrap();

        assert_eq!(result.new_count, 0);
        assert!(result.cursor_advanced);
        assert_eq!(store.load_cursor(), Some(43));
        assert!(!store.messages_path().exists());
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (store, _dir) = temp_store();
        store.save_cursor(200).unwrap();
        let source = FakeSource::fixed(vec![text_update(150, 1, 5, "stale", 1000)]);

        let result = Fetcher::new(source, store.clone(), None).run().await.unwrap();

        assert_eq!(result.new_count, 1);
        assert!(!result.cursor_advanced);
        assert_eq!(result.cursor, Some(200));
        assert_eq!(store.load_cursor(), Some(200));
    }

    #[tokio::test]
    async fn test_single_update_at_cursor_advances() {
        let (store, _dir) = temp_store();
        store.save_cursor(101).unwrap();
        let source = FakeSource::stream(vec![text_update(101, 2, 5, "next", 2000)]);

        let result = Fetcher::new(source, store.clone(), None).run().await.unwrap();

        assert!(result.cursor_advanced);
        assert_eq!(store.load_cursor(), Some(102));
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_is_archived_once() {
        let (store, _dir) = temp_store();
        let source = FakeSource::stream(vec![
            text_update(1, 7, 5, "first copy", 1000),
            text_update(2, 7, 5, "second copy", 1000),
        ]);

        let result = Fetcher::new(source, store.clone(), None).run().await.unwrap();

        assert_eq!(result.new_count, 1);
        let log = store.load_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "first copy");
        assert_eq!(store.load_cursor(), Some(3));
    }

    #[tokio::test]
    async fn test_channel_posts_are_archived() {
        let (store, _dir) = temp_store();
        let post: RawUpdate = serde_json::from_value(json!({
            "update_id": 9,
            "channel_post": {
                "message_id": 4,
                "chat": {"id": -100, "type": "channel"},
                "text": "announcement",
                "date": 50
            }
        }))
        .unwrap();

        let result = Fetcher::new(FakeSource::stream(vec![post]), store.clone(), Some(-100))
            .run()
            .await
            .unwrap();

        assert_eq!(result.new_count, 1);
        let log = store.load_log();
        assert_eq!(log[0].sender_id, None);
        assert_eq!(log[0].sender_name, "Unknown");
        assert_eq!(log[0].text, "announcement");
    }

    #[tokio::test]
    async fn test_corrupt_log_heals_on_next_merge() {
        let (store, _dir) = temp_store();
        std::fs::create_dir_all(store.messages_path().parent().unwrap()).unwrap();
        std::fs::write(store.messages_path(), "{not json").unwrap();
        std::fs::write(store.cursor_path(), "garbage").unwrap();

        let source = FakeSource::stream(vec![text_update(5, 1, 5, "hi", 1000)]);
        let fetcher = Fetcher::new(source, store.clone(), None);
        let result = fetcher.run().await.unwrap();

        assert_eq!(fetcher.source.requested(), vec![None]);
        assert_eq!(result.new_count, 1);
        assert_eq!(store.load_log().len(), 1);
        assert_eq!(store.load_cursor(), Some(6));
    }

    #[tokio::test]
    async fn test_message_ids_stay_unique_across_runs() {
        let (store, _dir) = temp_store();
        let batch = vec![
            text_update(1, 1, 5, "a", 10),
            text_update(2, 2, 5, "b", 20),
            text_update(3, 1, 5, "a again", 30),
        ];

        // A crash after the log write but before the cursor write means the
        // same updates come back on the next run
        Fetcher::new(FakeSource::fixed(batch.clone()), store.clone(), None)
            .run()
            .await
            .unwrap();
        std::fs::remove_file(store.cursor_path()).unwrap();
        Fetcher::new(FakeSource::fixed(batch), store.clone(), None)
            .run()
            .await
            .unwrap();

        let log = store.load_log();
        let ids = message_ids(&log);
        assert_eq!(ids.len(), log.len());
        assert_eq!(log.len(), 2);
        assert_sorted(&log);
    }
}
