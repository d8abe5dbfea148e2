use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extension of chat transcripts
pub const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Where transcripts come from
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Keys of every entity that has a transcript directory, sorted
    async fn list_entities(&self) -> Result<Vec<String>>;

    /// Conversation names of one entity, sorted
    async fn list_conversations(&self, entity_key: &str) -> Result<Vec<String>>;

    /// Raw transcript bytes, `None` if the conversation does not exist
    async fn read_transcript(&self, entity_key: &str, chat_name: &str) -> Result<Option<Vec<u8>>>;
}

/// Transcripts laid out as `<root>/<entity>/<conversation>.jsonl`
#[derive(Debug, Clone)]
pub struct FsTranscriptSource {
    root: PathBuf,
}

impl FsTranscriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transcript_path(&self, entity_key: &str, chat_name: &str) -> Result<PathBuf> {
        check_component(entity_key)?;
        check_component(chat_name)?;
        Ok(self
            .root
            .join(entity_key)
            .join(format!("{chat_name}.{TRANSCRIPT_EXTENSION}")))
    }

    /// Map a transcript path back to its entity key and conversation name.
    pub fn identify(&self, path: &Path) -> Option<(String, String)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let entity = components.next()?.as_os_str().to_str()?.to_string();
        let file = Path::new(components.next()?.as_os_str());
        if components.next().is_some()
            || file.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXTENSION)
        {
            return None;
        }
        let chat = file.file_stem()?.to_str()?.to_string();
        Some((entity, chat))
    }

    fn list_dir(dir: PathBuf, want_dirs: bool) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
            let path = entry.path();
            if want_dirs {
                if entry.file_type().is_dir()
                    && let Some(name) = path.file_name().and_then(|n| n.to_str())
                {
                    names.push(name.to_string());
                }
            } else if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(TRANSCRIPT_EXTENSION)
                && let Some(stem) = path.file_stem().and_then(|n| n.to_str())
            {
                names.push(stem.to_string());
            }
        }
        Ok(names)
    }
}

pub(crate) fn check_component(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        anyhow::bail!("Invalid entity or conversation name: {name:?}");
    }
    Ok(())
}

#[async_trait]
impl TranscriptSource for FsTranscriptSource {
    async fn list_entities(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::list_dir(root, true)).await?
    }

    async fn list_conversations(&self, entity_key: &str) -> Result<Vec<String>> {
        check_component(entity_key)?;
        let dir = self.root.join(entity_key);
        tokio::task::spawn_blocking(move || Self::list_dir(dir, false)).await?
    }

    async fn read_transcript(&self, entity_key: &str, chat_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.transcript_path(entity_key, chat_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}
