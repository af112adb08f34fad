//! Per-document view state that survives restarts: page, zoom, layout.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layout::{PageLayout, ZoomMode};
use crate::options::Rotation;
use crate::{DocumentId, DocumentInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedViewState {
    pub current_page: usize,
    pub zoom_factor: f64,
    pub zoom_mode: ZoomMode,
    pub page_layout: PageLayout,
    pub rotation: Rotation,
    pub continuous: bool,
}

impl Default for PersistedViewState {
    fn default() -> Self {
        Self {
            current_page: 0,
            zoom_factor: 1.0,
            zoom_mode: ZoomMode::CustomZoom,
            page_layout: PageLayout::SinglePage,
            rotation: Rotation::Rotate0,
            continuous: true,
        }
    }
}

impl PersistedViewState {
    /// The file may have lost pages since the state was written.
    pub fn clamped_to(mut self, doc: &DocumentInfo) -> Self {
        self.current_page = self.current_page.min(doc.page_count.saturating_sub(1));
        self
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>>;
    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()>;
}

/// `<data-local>/state` under the given project directories.
pub fn default_state_dir(project_dirs: &ProjectDirs) -> PathBuf {
    project_dirs.data_local_dir().join("state")
}

const STATE_FORMAT_VERSION: u32 = 1;

/// On-disk envelope around [`PersistedViewState`].
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    document: PathBuf,
    page_count: usize,
    view: PersistedViewState,
}

/// One JSON file per document, named after its id. Files written by another
/// format version are ignored.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, id: DocumentId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        let path = self.state_path(doc.id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read state file {:?}", path));
            }
        };
        let file: StateFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        if file.version != STATE_FORMAT_VERSION {
            debug!(
                path = %path.display(),
                version = file.version,
                "ignoring view state from another version"
            );
            return Ok(None);
        }
        if file.page_count != doc.page_count {
            debug!(
                saved = file.page_count,
                now = doc.page_count,
                "page count changed since state was saved"
            );
        }
        Ok(Some(file.view.clamped_to(doc)))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        let path = self.state_path(doc.id);
        let file = StateFile {
            version: STATE_FORMAT_VERSION,
            document: doc.path.clone(),
            page_count: doc.page_count,
            view: state.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)
            .with_context(|| format!("failed to write state file {:?}", tmp))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move state file into place at {:?}", path))?;
        debug!(path = %path.display(), page = state.current_page, "view state saved");
        Ok(())
    }
}

/// Keeps state for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<DocumentId, PersistedViewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        Ok(self
            .inner
            .lock()
            .get(&doc.id)
            .cloned()
            .map(|state| state.clamped_to(doc)))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        self.inner.lock().insert(doc.id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeAdapter;
    use crate::{DocumentAdapter, SizeF};

    use tempfile::tempdir;

    fn sample_state() -> PersistedViewState {
        PersistedViewState {
            current_page: 7,
            zoom_factor: 1.5,
            zoom_mode: ZoomMode::FitToWidth,
            page_layout: PageLayout::BookView,
            rotation: Rotation::Rotate90,
            continuous: false,
        }
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let doc_path = dir.path().join("sample.pdf");
        std::fs::write(&doc_path, b"dummy").unwrap();
        let adapter = FakeAdapter::with_pages(&doc_path, vec![SizeF::new(100.0, 100.0); 10]);

        let state_dir = dir.path().join("state");
        let store = FileStateStore::new(state_dir.clone()).unwrap();
        assert!(store.load(adapter.info()).unwrap().is_none());
        store.save(adapter.info(), &sample_state()).unwrap();

        let reopened = FileStateStore::new(state_dir).unwrap();
        assert_eq!(reopened.load(adapter.info()).unwrap(), Some(sample_state()));
    }

    #[test]
    fn file_store_ignores_other_format_versions() {
        let dir = tempdir().unwrap();
        let adapter = FakeAdapter::with_pages(
            &dir.path().join("sample.pdf"),
            vec![SizeF::new(100.0, 100.0); 10],
        );
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        store.save(adapter.info(), &sample_state()).unwrap();

        let path = store.state_path(adapter.info().id);
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("\"version\": 1"));
        std::fs::write(&path, saved.replace("\"version\": 1", "\"version\": 99")).unwrap();
        assert!(store.load(adapter.info()).unwrap().is_none());

        std::fs::write(&path, "not json").unwrap();
        assert!(store.load(adapter.info()).is_err());
    }

    #[test]
    fn saved_page_is_clamped_when_the_document_shrank() {
        let dir = tempdir().unwrap();
        let doc_path = dir.path().join("sample.pdf");
        let before = FakeAdapter::with_pages(&doc_path, vec![SizeF::new(100.0, 100.0); 10]);
        let after = FakeAdapter::with_pages(&doc_path, vec![SizeF::new(100.0, 100.0); 3]);

        let store = FileStateStore::new(dir.path().join("state")).unwrap();
        store.save(before.info(), &sample_state()).unwrap();
        let restored = store.load(after.info()).unwrap().unwrap();
        assert_eq!(restored.current_page, 2);
        assert_eq!(restored.page_layout, PageLayout::BookView);
    }

    #[test]
    fn memory_store_keys_by_document() {
        let store = MemoryStateStore::new();
        let pages = vec![SizeF::new(100.0, 100.0); 10];
        let first = FakeAdapter::with_pages(std::path::Path::new("/tmp/a.pdf"), pages.clone());
        let second = FakeAdapter::with_pages(std::path::Path::new("/tmp/b.pdf"), pages);
        store.save(first.info(), &sample_state()).unwrap();
        assert!(store.load(second.info()).unwrap().is_none());
        assert_eq!(store.load(first.info()).unwrap(), Some(sample_state()));
    }
}
