//! On-disk form of a [`StatsCollection`].

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};

use super::{STATS_VERSION, StatsCollection};
use crate::types::EntityStats;

/// Why a persisted document could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    Missing,
    Corrupt(String),
    VersionMismatch { found: u32 },
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u32,
}

/// The global entity is written without its summaries; they are the same
/// summaries the entities carry and get re-linked on load.
pub(super) fn serialize_global<S: Serializer>(
    global: &Arc<EntityStats>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    if global.chat_summaries.is_empty() {
        return global.serialize(serializer);
    }
    let stripped = EntityStats {
        chat_summaries: Vec::new(),
        ..EntityStats::clone(global)
    };
    stripped.serialize(serializer)
}

/// Read the collection stored at `path`.
pub fn load_collection(path: &Path) -> std::result::Result<StatsCollection, LoadError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(LoadError::Missing),
        Err(e) => return Err(LoadError::Corrupt(e.to_string())),
    };

    let mut probe_buf = data.clone();
    let probe: VersionProbe = simd_json::from_slice(&mut probe_buf)
        .map_err(|e| LoadError::Corrupt(e.to_string()))?;
    if probe.version != STATS_VERSION {
        return Err(LoadError::VersionMismatch {
            found: probe.version,
        });
    }

    let mut buf = data;
    let mut collection: StatsCollection =
        simd_json::from_slice(&mut buf).map_err(|e| LoadError::Corrupt(e.to_string()))?;
    collection.relink_global();
    Ok(collection)
}

/// Atomically write `collection` to `path` via a temp file + rename.
pub fn save_collection(path: &Path, collection: &StatsCollection) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let bytes = simd_json::to_vec(collection).context("Failed to serialize stats")?;

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create {}", temp_path.display()))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}
