use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

pub mod cancel;
pub mod config;
pub mod geometry;
pub mod layout;
pub mod navigation;
pub mod options;
pub mod state;
pub mod transform;

pub use cancel::CancellationToken;
pub use geometry::{PixelSize, Rect, RectF, SizeF};
pub use options::{RenderFlags, RenderOptions, Rotation};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d2b8e-5c41-5e7a-9b1d-2c6e8a4f7d90").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub created: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    /// Intrinsic page sizes in points, one per page in index order.
    pub page_sizes: Vec<SizeF>,
    pub metadata: DocumentMetadata,
}

impl DocumentInfo {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|s| s.to_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DocumentStatus {
    #[default]
    Null,
    Loading,
    Ready,
    Unloading,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("file not found: {path:?}")]
    FileNotFound { path: PathBuf },
    #[error("incorrect or missing password for {path:?}")]
    IncorrectPassword { path: PathBuf },
    #[error("failed to load {path:?}: {reason}")]
    Unknown { path: PathBuf, reason: String },
}

/// Bitmap produced by an adapter, RGBA8, rows tightly packed.
///
/// A zero-sized image stands for "not available yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
}

impl RenderImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.pixels.is_empty()
    }

    pub fn size(&self) -> PixelSize {
        PixelSize::new(self.width, self.height)
    }
}

impl Default for RenderImage {
    fn default() -> Self {
        Self::empty()
    }
}

/// One opened document, as seen through its codec.
///
/// Implementations must tolerate calls from the render pool and the search
/// worker at the same time.
pub trait DocumentAdapter: Send + Sync {
    fn info(&self) -> &DocumentInfo;

    fn page_count(&self) -> usize {
        self.info().page_count
    }

    fn page_size(&self, page_index: usize) -> Option<SizeF> {
        self.info().page_sizes.get(page_index).copied()
    }

    /// `size` is the unrotated target size. The returned bitmap is turned by
    /// `options.rotation`, so quarter turns swap its width and height.
    fn render_page(
        &self,
        page_index: usize,
        size: PixelSize,
        options: RenderOptions,
    ) -> Result<RenderImage>;

    /// Text inside `region` (page points), or the whole page when `None`.
    fn extract_text(&self, page_index: usize, region: Option<RectF>) -> Result<String>;

    /// Case-insensitive search; rectangles are in unrotated page points.
    fn search_page(
        &self,
        page_index: usize,
        needle: &str,
        options: RenderOptions,
    ) -> Result<Vec<RectF>>;

    fn thumbnail(&self, page_index: usize) -> Result<RenderImage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentAdapter>>;
}

/// Lifecycle wrapper around an adapter: tracks status and the last load error.
pub struct Document {
    path: PathBuf,
    status: DocumentStatus,
    error: Option<DocumentError>,
    adapter: Option<Arc<dyn DocumentAdapter>>,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            status: DocumentStatus::Null,
            error: None,
            adapter: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn error(&self) -> Option<&DocumentError> {
        self.error.as_ref()
    }

    pub fn adapter(&self) -> Option<Arc<dyn DocumentAdapter>> {
        self.adapter.clone()
    }

    pub fn page_count(&self) -> usize {
        self.adapter.as_ref().map_or(0, |doc| doc.page_count())
    }

    #[instrument(skip(self, provider), fields(path = %self.path.display()))]
    pub async fn load<P: DocumentProvider + ?Sized>(
        &mut self,
        provider: &P,
    ) -> Result<(), DocumentError> {
        self.status = DocumentStatus::Loading;
        self.error = None;

        if !self.path.exists() {
            return Err(self.fail(DocumentError::FileNotFound {
                path: self.path.clone(),
            }));
        }

        match provider.open(&self.path).await {
            Ok(adapter) => {
                debug!(pages = adapter.page_count(), "document ready");
                self.adapter = Some(adapter);
                self.status = DocumentStatus::Ready;
                Ok(())
            }
            Err(err) => {
                let error = err
                    .downcast_ref::<DocumentError>()
                    .cloned()
                    .unwrap_or_else(|| DocumentError::Unknown {
                        path: self.path.clone(),
                        reason: format!("{err:#}"),
                    });
                Err(self.fail(error))
            }
        }
    }

    /// Drops the current adapter and loads the file again.
    pub async fn reload<P: DocumentProvider + ?Sized>(
        &mut self,
        provider: &P,
    ) -> Result<(), DocumentError> {
        self.close();
        self.load(provider).await
    }

    pub fn close(&mut self) {
        self.adapter = None;
        self.status = DocumentStatus::Null;
    }

    fn fail(&mut self, error: DocumentError) -> DocumentError {
        self.adapter = None;
        self.status = DocumentStatus::Failed;
        self.error = Some(error.clone());
        error
    }
}
