use anyhow::Result;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Mutex, watch};

use crate::conversation::ConversationAggregator;
use crate::source::{FsTranscriptSource, TranscriptSource, check_component};
use crate::store::{
    LoadMode, RebuildReport, StatsCollection, StatsStore, StatsView, UpdateOutcome,
};
use crate::watcher::WatcherEvent;

/// Directory under a user's data directory holding the transcripts
pub const CHATS_DIR: &str = "chats";
/// File under a user's data directory holding the persisted stats
pub const STATS_FILE: &str = "stats.json";

/// One user's store plus its published snapshot.
///
/// Writers queue on the store lock; readers only touch the snapshot, which is
/// republished after every mutation.
pub struct UserStats {
    user: String,
    store: Mutex<StatsStore>,
    snapshot_tx: watch::Sender<Arc<StatsCollection>>,
}

impl UserStats {
    pub fn new(user: impl Into<String>, store: StatsStore) -> Self {
        let (snapshot_tx, _) = watch::channel(store.snapshot());
        Self {
            user: user.into(),
            store: Mutex::new(store),
            snapshot_tx,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Most recently published state; never waits for a running mutation.
    pub fn snapshot(&self) -> Arc<StatsCollection> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatsCollection>> {
        self.snapshot_tx.subscribe()
    }

    pub fn get(&self, entity_key: Option<&str>, chat_name: Option<&str>) -> Option<StatsView> {
        self.snapshot().get(entity_key, chat_name)
    }

    fn publish(&self, store: &StatsStore) {
        self.snapshot_tx.send_replace(store.snapshot());
    }

    pub async fn update(&self, entity_key: &str, chat_name: &str) -> Result<UpdateOutcome> {
        let mut store = self.store.lock().await;
        let outcome = store.update(entity_key, chat_name).await?;
        if outcome != UpdateOutcome::Unchanged {
            self.publish(&store);
        }
        Ok(outcome)
    }

    pub async fn remove(&self, entity_key: &str, chat_name: &str) -> UpdateOutcome {
        let mut store = self.store.lock().await;
        let outcome = store.remove(entity_key, chat_name);
        if outcome == UpdateOutcome::Retracted {
            self.publish(&store);
        }
        outcome
    }

    pub async fn rebuild_entity(&self, entity_key: &str) -> Result<RebuildReport> {
        let mut store = self.store.lock().await;
        let report = store.rebuild_entity(entity_key).await?;
        self.publish(&store);
        Ok(report)
    }

    pub async fn rebuild_all(&self, cancel: &AtomicBool) -> Result<RebuildReport> {
        let mut store = self.store.lock().await;
        let report = store.rebuild_all(cancel).await?;
        self.publish(&store);
        Ok(report)
    }

    /// Whether the stored stats were unusable and still await a rebuild.
    pub async fn is_stale(&self) -> bool {
        self.store.lock().await.is_stale()
    }

    /// Save if dirty. Returns whether anything was written.
    pub async fn flush(&self) -> Result<bool> {
        self.store.lock().await.save().await
    }

    /// Apply one watcher event to this user's stats.
    pub async fn handle_watcher_event(&self, event: WatcherEvent) -> Result<()> {
        match event {
            WatcherEvent::ConversationChanged { entity, chat } => {
                let outcome = self.update(&entity, &chat).await?;
                tracing::debug!(user = %self.user, %entity, %chat, ?outcome, "applied change");
            }
            WatcherEvent::ConversationDeleted { entity, chat } => {
                let outcome = self.remove(&entity, &chat).await;
                tracing::debug!(user = %self.user, %entity, %chat, ?outcome, "applied deletion");
            }
            WatcherEvent::Error(error) => {
                tracing::warn!(user = %self.user, %error, "file watcher error");
            }
        }
        Ok(())
    }
}

/// All users' stats, each loaded on first access.
pub struct StatsRegistry {
    data_root: PathBuf,
    aggregator: ConversationAggregator,
    users: DashMap<String, Arc<UserStats>>,
    load_lock: Mutex<()>,
}

impl StatsRegistry {
    pub fn new(data_root: impl Into<PathBuf>, aggregator: ConversationAggregator) -> Self {
        Self {
            data_root: data_root.into(),
            aggregator,
            users: DashMap::new(),
            load_lock: Mutex::new(()),
        }
    }

    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.data_root.join(user)
    }

    pub fn chats_root(&self, user: &str) -> PathBuf {
        self.user_dir(user).join(CHATS_DIR)
    }

    #[cfg(test)]
    pub fn is_loaded(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    /// The user's stats, loading or rebuilding them on first access.
    pub async fn user(&self, user: &str) -> Result<Arc<UserStats>> {
        self.user_with(user, LoadMode::Rebuild).await
    }

    /// Like [`user`](Self::user), choosing what happens when the stored stats
    /// are unusable on first access.
    pub async fn user_with(&self, user: &str, mode: LoadMode) -> Result<Arc<UserStats>> {
        if let Some(existing) = self.users.get(user) {
            return Ok(Arc::clone(existing.value()));
        }

        check_component(user)?;
        let _guard = self.load_lock.lock().await;
        if let Some(existing) = self.users.get(user) {
            return Ok(Arc::clone(existing.value()));
        }

        let source: Arc<dyn TranscriptSource> =
            Arc::new(FsTranscriptSource::new(self.chats_root(user)));
        let store = StatsStore::load_with(
            source,
            self.user_dir(user).join(STATS_FILE),
            self.aggregator,
            mode,
        )
        .await?;

        let stats = Arc::new(UserStats::new(user, store));
        self.users.insert(user.to_string(), Arc::clone(&stats));
        tracing::info!(user, "loaded user stats");
        Ok(stats)
    }

    /// Save every dirty user store; users are flushed concurrently.
    ///
    /// Returns how many stores were written. A failing user is logged and
    /// does not stop the others.
    pub async fn flush_all(&self) -> usize {
        let users: Vec<Arc<UserStats>> = self
            .users
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = futures::future::join_all(users.iter().map(|u| u.flush())).await;

        let mut saved = 0;
        for (user, result) in users.iter().zip(results) {
            match result {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(user = %user.user(), error = %error, "failed to save stats");
                }
            }
        }
        saved
    }
}
