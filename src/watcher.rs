use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_types::event::{Event, EventKind};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::registry::{StatsRegistry, UserStats};
use crate::source::FsTranscriptSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// A transcript was created or modified
    ConversationChanged { entity: String, chat: String },
    /// A transcript was deleted
    ConversationDeleted { entity: String, chat: String },
    /// An error occurred
    Error(String),
}

impl WatcherEvent {
    fn conversation(&self) -> Option<(&str, &str)> {
        match self {
            WatcherEvent::ConversationChanged { entity, chat }
            | WatcherEvent::ConversationDeleted { entity, chat } => {
                Some((entity.as_str(), chat.as_str()))
            }
            WatcherEvent::Error(_) => None,
        }
    }
}

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    event_rx: UnboundedReceiver<WatcherEvent>,
}

impl FileWatcher {
    /// Watch the chats root of `source` recursively.
    pub fn new(source: FsTranscriptSource) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = source.root().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => handle_fs_event(event, &event_tx, &source),
                Err(e) => {
                    let _ = event_tx.send(WatcherEvent::Error(format!("Watch error: {e}")));
                }
            })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching transcripts");

        Ok(Self {
            _watcher: watcher,
            event_rx,
        })
    }

    pub async fn recv(&mut self) -> Option<WatcherEvent> {
        self.event_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatcherEvent> {
        self.event_rx.try_recv().ok()
    }
}

fn handle_fs_event(event: Event, tx: &UnboundedSender<WatcherEvent>, source: &FsTranscriptSource) {
    let deleted = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => return,
    };

    for path in &event.paths {
        let Some((entity, chat)) = source.identify(path) else {
            continue;
        };
        // Renames arrive as modifications; a path that is gone is picked up
        // as a retraction when the store re-reads it.
        let event = if deleted {
            WatcherEvent::ConversationDeleted { entity, chat }
        } else {
            WatcherEvent::ConversationChanged { entity, chat }
        };
        let _ = tx.send(event);
    }
}

/// Keep only the last event per conversation, in conversation order.
pub fn coalesce(events: Vec<WatcherEvent>) -> Vec<WatcherEvent> {
    let mut latest: BTreeMap<(String, String), WatcherEvent> = BTreeMap::new();
    let mut errors = Vec::new();
    for event in events {
        match event.conversation() {
            Some((entity, chat)) => {
                latest.insert((entity.to_string(), chat.to_string()), event);
            }
            None => errors.push(event),
        }
    }
    errors.extend(latest.into_values());
    errors
}

/// Feed transcript changes of `user` into the registry until `shutdown`
/// resolves, saving dirty stores every `flush_interval`.
pub async fn run(
    registry: &StatsRegistry,
    user: &str,
    flush_interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let stats = registry.user(user).await?;
    let mut watcher = FileWatcher::new(FsTranscriptSource::new(registry.chats_root(user)))?;

    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                registry.flush_all().await;
            }
            event = watcher.recv() => {
                let Some(event) = event else { break };
                let mut batch = vec![event];
                while let Some(more) = watcher.try_recv() {
                    batch.push(more);
                }
                apply_batch(&stats, batch).await;
            }
        }
    }

    registry.flush_all().await;
    Ok(())
}

async fn apply_batch(stats: &Arc<UserStats>, batch: Vec<WatcherEvent>) {
    for event in coalesce(batch) {
        if let Err(error) = stats.handle_watcher_event(event).await {
            tracing::warn!(user = %stats.user(), error = %error, "failed to apply change");
        }
    }
}
