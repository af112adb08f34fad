use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use docview_core::{
    document_id_for_path, DocumentAdapter, DocumentError, DocumentInfo, DocumentMetadata,
    DocumentProvider, PixelSize, RectF, RenderFlags, RenderImage, RenderOptions, Rotation, SizeF,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

const LIBRARY_PATH_ENV: &str = "DOCVIEW_PDFIUM_LIBRARY_PATH";
const THUMBNAIL_WIDTH: i32 = 128;

/// Opens PDF files through a shared PDFium binding.
pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentAdapter>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let info = build_document_info(&self.pdfium, &absolute)?;
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    info: DocumentInfo,
    path: PathBuf,
    pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            info,
            path,
            pdfium,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It is
        // stored in `self.document`, which is declared before `pdfium` and is
        // therefore dropped first.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    /// PDFium is not re-entrant; every call goes through this lock.
    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            *guard = Some(self.open_document()?);
        }
        let document = guard
            .as_ref()
            .ok_or_else(|| anyhow!("document {:?} is not loaded", self.path))?;
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }

    fn render_with(&self, page_index: usize, config: &PdfRenderConfig) -> Result<RenderImage> {
        self.with_page(page_index, |page| {
            let bitmap = page
                .render_with_config(config)
                .with_context(|| format!("failed to render page {}", page_index))?;
            let image = bitmap.as_image().to_rgba8();
            Ok(RenderImage::new(
                image.width(),
                image.height(),
                image.into_raw(),
            ))
        })
    }
}

impl DocumentAdapter for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self, options), fields(rotation = options.rotation.degrees()))]
    fn render_page(
        &self,
        page_index: usize,
        size: PixelSize,
        options: RenderOptions,
    ) -> Result<RenderImage> {
        let width = i32::try_from(size.width).unwrap_or(i32::MAX);
        let height = i32::try_from(size.height).unwrap_or(i32::MAX);
        let flags = options.flags;
        let config = PdfRenderConfig::new()
            .set_target_size(width, height)
            .rotate(render_rotation(options.rotation), true)
            .render_annotations(flags.contains(RenderFlags::ANNOTATIONS))
            .use_lcd_text_rendering(flags.contains(RenderFlags::OPTIMIZED_FOR_LCD))
            .use_grayscale_rendering(flags.contains(RenderFlags::GRAYSCALE))
            .force_half_tone(flags.contains(RenderFlags::FORCE_HALFTONE))
            .set_text_smoothing(!flags.contains(RenderFlags::TEXT_ALIASED))
            .set_image_smoothing(!flags.contains(RenderFlags::IMAGE_ALIASED))
            .set_path_smoothing(!flags.contains(RenderFlags::PATH_ALIASED));
        self.render_with(page_index, &config)
    }

    fn extract_text(&self, page_index: usize, region: Option<RectF>) -> Result<String> {
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let Some(region) = region else {
                return Ok(text.all());
            };
            // page space has its origin at the bottom left
            let page_height = page.height().value as f64;
            let rect = PdfRect::new_from_values(
                (page_height - region.bottom()) as f32,
                region.x as f32,
                (page_height - region.y) as f32,
                region.right() as f32,
            );
            Ok(text.inside_rect(rect))
        })
    }

    #[instrument(skip(self, _options))]
    fn search_page(
        &self,
        page_index: usize,
        needle: &str,
        _options: RenderOptions,
    ) -> Result<Vec<RectF>> {
        if needle.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let search = text
                .search(needle, &PdfSearchOptions::new())
                .with_context(|| format!("failed to perform search on page {}", page_index))?;

            let page_height = page.height().value as f64;
            let mut hits = Vec::new();
            while let Some(segments) = search.find_next() {
                for segment in segments.iter() {
                    let bounds = segment.bounds();
                    let left = bounds.left().value as f64;
                    let right = bounds.right().value as f64;
                    let top = bounds.top().value as f64;
                    let bottom = bounds.bottom().value as f64;
                    let rect = RectF::new(left, page_height - top, right - left, top - bottom);
                    if !rect.is_empty() {
                        hits.push(rect);
                    }
                }
            }
            Ok(hits)
        })
    }

    fn thumbnail(&self, page_index: usize) -> Result<RenderImage> {
        let config = PdfRenderConfig::new().set_target_width(THUMBNAIL_WIDTH);
        self.render_with(page_index, &config)
    }
}

fn render_rotation(rotation: Rotation) -> PdfPageRenderRotation {
    match rotation {
        Rotation::Rotate0 => PdfPageRenderRotation::None,
        Rotation::Rotate90 => PdfPageRenderRotation::Degrees90,
        Rotation::Rotate180 => PdfPageRenderRotation::Degrees180,
        Rotation::Rotate270 => PdfPageRenderRotation::Degrees270,
    }
}

fn build_document_info(pdfium: &Pdfium, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|err| match err {
            PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
                anyhow::Error::new(DocumentError::IncorrectPassword {
                    path: path.to_path_buf(),
                })
            }
            other => anyhow!(other).context(format!("failed to open {:?}", path)),
        })?;

    let page_sizes: Vec<SizeF> = document
        .pages()
        .iter()
        .map(|page| SizeF::new(page.width().value as f64, page.height().value as f64))
        .collect();

    let metadata = document.metadata();
    let tag = |kind| metadata.get(kind).map(|t| t.value().to_owned());
    let keywords = tag(PdfDocumentMetadataTagType::Keywords)
        .map(|value| value.split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_default();

    Ok(DocumentInfo {
        id: document_id_for_path(path),
        path: path.to_path_buf(),
        page_count: page_sizes.len(),
        page_sizes,
        metadata: DocumentMetadata {
            title: tag(PdfDocumentMetadataTagType::Title),
            author: tag(PdfDocumentMetadataTagType::Author),
            creator: tag(PdfDocumentMetadataTagType::Creator),
            producer: tag(PdfDocumentMetadataTagType::Producer),
            created: tag(PdfDocumentMetadataTagType::CreationDate),
            keywords,
        },
    })
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var(LIBRARY_PATH_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}={}: {}", LIBRARY_PATH_ENV, path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
