//! Instrument asset access.
//!
//! The core never performs network I/O; instrument binaries arrive
//! through [`InstrumentAssets`], already resolved by the host's download
//! cache. A directory-backed implementation ships for local soundfont
//! files, and an in-memory one for tests.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Storage key naming an instrument asset in the host's cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Read access to resolved instrument binaries.
pub trait InstrumentAssets {
    fn instrument_data(&self, id: &InstrumentId) -> Result<Arc<[u8]>, EngineError>;
}

/// Serves instrument files from a directory, keyed by file name.
/// Bytes are cached after the first read.
pub struct DirAssets {
    root: PathBuf,
    cache: Mutex<HashMap<InstrumentId, Arc<[u8]>>>,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl InstrumentAssets for DirAssets {
    fn instrument_data(&self, id: &InstrumentId) -> Result<Arc<[u8]>, EngineError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(data) = cache.get(id) {
                return Ok(data.clone());
            }
        }
        let path = self.root.join(id.as_str());
        let bytes = fs::read(&path).map_err(|e| EngineError::InstrumentLoad {
            id: id.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        debug!(instrument = %id, bytes = bytes.len(), "read instrument asset");
        let data: Arc<[u8]> = bytes.into();
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id.clone(), data.clone());
        }
        Ok(data)
    }
}

/// In-memory asset map for tests.
#[derive(Default)]
pub struct MemoryAssets {
    assets: HashMap<InstrumentId, Arc<[u8]>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: InstrumentId, data: Vec<u8>) {
        self.assets.insert(id, data.into());
    }
}

impl InstrumentAssets for MemoryAssets {
    fn instrument_data(&self, id: &InstrumentId) -> Result<Arc<[u8]>, EngineError> {
        self.assets
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::InstrumentLoad {
                id: id.to_string(),
                reason: "not in asset cache".to_string(),
            })
    }
}
