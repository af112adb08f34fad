use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use docview_core::config::ViewerConfig;
use docview_core::layout::{PageLayout, ZoomMode};
use docview_core::state::{default_state_dir, FileStateStore, StateStore};
use docview_core::{Document, DocumentAdapter, PixelSize, RenderImage, RenderOptions, Rotation};
use docview_render::{PageRenderer, PdfiumProvider};
use docview_search::{SearchEngine, SearchEvent};
use docview_view::{DocumentView, FileEvent, FileWatcher};
use image::RgbaImage;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const RENDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    name = "docview",
    version,
    about = "Render and search paginated documents from the command line"
)]
struct Args {
    /// Configuration file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Print page count, page sizes and metadata
    Info { file: PathBuf },
    /// Render a single page to a PNG file
    Render {
        file: PathBuf,
        /// Page to render (0-based)
        #[arg(short = 'p', long, default_value_t = 0)]
        page: usize,
        /// Output width in pixels before rotation
        #[arg(short = 'w', long)]
        width: Option<u32>,
        /// Clockwise rotation in degrees (multiple of 90)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        rotate: i32,
        #[arg(short = 'o', long)]
        out: PathBuf,
    },
    /// Search the whole document, starting at a page
    Search {
        file: PathBuf,
        needle: String,
        /// Page the search starts on (0-based)
        #[arg(short = 'p', long, default_value_t = 0)]
        page: usize,
    },
    /// Composite one viewport-sized frame of the scrolled document
    View {
        file: PathBuf,
        /// Page to scroll to (0-based); defaults to the last saved position
        #[arg(short = 'p', long)]
        page: Option<usize>,
        /// Viewport size as WIDTHxHEIGHT
        #[arg(long, default_value = "800x1000", value_parser = parse_viewport)]
        viewport: (i32, i32),
        /// Zoom factor; implies custom zoom
        #[arg(long)]
        zoom: Option<f64>,
        #[arg(long, value_enum)]
        zoom_mode: Option<ZoomArg>,
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
        /// Highlight hits of this text
        #[arg(long)]
        search: Option<String>,
        /// Re-render the frame whenever the file changes
        #[arg(long)]
        watch: bool,
        #[arg(short = 'o', long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Single,
    Facing,
    Book,
    Overview,
}

impl From<LayoutArg> for PageLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Single => PageLayout::SinglePage,
            LayoutArg::Facing => PageLayout::FacingPages,
            LayoutArg::Book => PageLayout::BookView,
            LayoutArg::Overview => PageLayout::OverView,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ZoomArg {
    Custom,
    FitWidth,
    FitPage,
}

impl From<ZoomArg> for ZoomMode {
    fn from(value: ZoomArg) -> Self {
        match value {
            ZoomArg::Custom => ZoomMode::CustomZoom,
            ZoomArg::FitWidth => ZoomMode::FitToWidth,
            ZoomArg::FitPage => ZoomMode::FitInView,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "docview", "docview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = match &args.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::load_or_default(project_dirs.config_dir())?,
    };

    match args.command {
        CliCommand::Info { file } => {
            let document = open_document(&file).await?;
            print_info(document.as_ref());
        }
        CliCommand::Render {
            file,
            page,
            width,
            rotate,
            out,
        } => {
            let rotation = Rotation::from_degrees(rotate)
                .ok_or_else(|| anyhow!("rotation must be a multiple of 90, got {rotate}"))?;
            let document = open_document(&file).await?;
            let image = render_single(&config, document, page, width, rotation)?;
            save_png(to_rgba(&image)?, &out)?;
            println!("{}x{} -> {}", image.width, image.height, out.display());
        }
        CliCommand::Search { file, needle, page } => {
            let document = open_document(&file).await?;
            search_document(&config, document, &needle, page).await?;
        }
        CliCommand::View {
            file,
            page,
            viewport,
            zoom,
            zoom_mode,
            layout,
            search,
            watch,
            out,
        } => {
            let mut view = DocumentView::new(&config)?;
            view.set_viewport(viewport.0, viewport.1);
            let store = FileStateStore::new(default_state_dir(&project_dirs))?;

            let document = open_document(&file).await?;
            show_document(&mut view, &store, document, page)?;
            if let Some(layout) = layout {
                view.set_page_layout(layout.into());
            }
            if let Some(mode) = zoom_mode {
                view.set_zoom_mode(mode.into());
            }
            if let Some(zoom) = zoom {
                view.set_zoom_factor(zoom);
            }
            if let Some(needle) = &search {
                highlight_search(&mut view, needle)?;
            }
            write_frame(&mut view, &out)?;
            save_state(&view, &store);

            if watch {
                watch_and_refresh(&mut view, &store, &file, &out, search.as_deref()).await?;
            }
        }
    }

    Ok(())
}

async fn open_document(path: &Path) -> Result<Arc<dyn DocumentAdapter>> {
    if !path.exists() {
        bail!("file not found: {}", path.display());
    }
    let provider = PdfiumProvider::new()?;
    let mut document = Document::new(path);
    document
        .load(&provider)
        .await
        .with_context(|| format!("failed to open {:?}", path))?;
    document
        .adapter()
        .ok_or_else(|| anyhow!("{:?} has no pages to show", path))
}

fn print_info(document: &dyn DocumentAdapter) {
    let info = document.info();
    println!("file: {}", info.path.display());
    println!("id: {}", info.id);
    println!("pages: {}", info.page_count);
    let metadata = &info.metadata;
    for (label, value) in [
        ("title", &metadata.title),
        ("author", &metadata.author),
        ("creator", &metadata.creator),
        ("producer", &metadata.producer),
        ("created", &metadata.created),
    ] {
        if let Some(value) = value {
            println!("{label}: {value}");
        }
    }
    if !metadata.keywords.is_empty() {
        println!("keywords: {}", metadata.keywords.join(", "));
    }
    for (index, size) in info.page_sizes.iter().enumerate() {
        println!("page {index}: {:.1} x {:.1} pt", size.width, size.height);
    }
}

fn render_single(
    config: &ViewerConfig,
    document: Arc<dyn DocumentAdapter>,
    page: usize,
    width: Option<u32>,
    rotation: Rotation,
) -> Result<RenderImage> {
    let page_size = document
        .page_size(page)
        .ok_or_else(|| anyhow!("page {page} out of range (document has {} pages)", document.page_count()))?;
    let natural = page_size.scaled_by(config.view.screen_resolution * config.view.zoom_factor);
    let unrotated = match width {
        Some(width) => {
            let height = (width as f64 * page_size.height / page_size.width).round() as u32;
            PixelSize::new(width, height.max(1))
        }
        None => natural.to_pixels(),
    };
    let size = rotation.apply_to_pixels(unrotated);
    let options = RenderOptions::default().with_rotation(rotation);

    let mut renderer = PageRenderer::new(&config.render)?;
    renderer.set_document(Some(document));
    renderer.request_page(page, size, options);
    while renderer.has_pending_work() {
        if !renderer.wait_for_completion(RENDER_TIMEOUT) {
            bail!("timed out rendering page {page}");
        }
    }
    let image = renderer.request_page(page, size, options);
    if image.is_empty() {
        bail!("page {page} could not be rendered");
    }
    Ok(image)
}

async fn search_document(
    config: &ViewerConfig,
    document: Arc<dyn DocumentAdapter>,
    needle: &str,
    page: usize,
) -> Result<()> {
    if needle.is_empty() {
        bail!("search text must not be empty");
    }
    let page_count = document.page_count();
    if page >= page_count {
        bail!("page {page} out of range (document has {page_count} pages)");
    }

    let engine = SearchEngine::new(&config.search)?;
    let events = engine.subscribe();
    engine.set_document(Some(document));
    engine.set_search_string(needle);
    engine.search_page(page);

    while let Ok(event) = events.recv_async().await {
        match event {
            SearchEvent::ResultsReady(page, rects) => {
                println!("page {page}: {} hit(s)", rects.len());
                for rect in rects {
                    println!(
                        "  {:.1},{:.1} {:.1}x{:.1}",
                        rect.x, rect.y, rect.width, rect.height
                    );
                }
            }
            SearchEvent::MatchesFound(_) => {}
            SearchEvent::SearchComplete(count) => {
                println!("total: {count}");
                return Ok(());
            }
        }
    }
    bail!("search stopped before completing")
}

fn show_document(
    view: &mut DocumentView,
    store: &FileStateStore,
    document: Arc<dyn DocumentAdapter>,
    page: Option<usize>,
) -> Result<()> {
    let saved = store.load(document.info()).unwrap_or_else(|err| {
        warn!(error = %err, "ignoring unreadable view state");
        None
    });
    view.set_document(Some(document));
    if let Some(state) = saved {
        view.restore_state(&state);
    }
    if let Some(page) = page {
        view.go_to_page(page);
    }
    Ok(())
}

fn highlight_search(view: &mut DocumentView, needle: &str) -> Result<()> {
    view.search_text(needle);
    let deadline = std::time::Instant::now() + RENDER_TIMEOUT;
    while !view.pump().search_complete {
        if std::time::Instant::now() > deadline {
            bail!("timed out searching for {needle:?}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    info!(matches = view.match_count(), "search finished");
    view.highlight_next();
    Ok(())
}

fn write_frame(view: &mut DocumentView, out: &Path) -> Result<()> {
    view.paint();
    let deadline = std::time::Instant::now() + RENDER_TIMEOUT;
    while view.renderer().has_pending_work() {
        if std::time::Instant::now() > deadline {
            bail!("timed out rendering the frame");
        }
        view.pump();
        std::thread::sleep(Duration::from_millis(10));
    }
    view.pump();
    let frame = view.paint();
    save_png(frame, out)?;
    println!(
        "page {} of {} -> {}",
        view.current_page() + 1,
        view.page_count(),
        out.display()
    );
    Ok(())
}

async fn watch_and_refresh(
    view: &mut DocumentView,
    store: &FileStateStore,
    file: &Path,
    out: &Path,
    search: Option<&str>,
) -> Result<()> {
    let provider = PdfiumProvider::new()?;
    let mut document = Document::new(file);
    let (_watcher, events) = FileWatcher::new(file)?;
    info!(path = %file.display(), "watching for changes; interrupt to stop");
    while let Ok(event) = events.recv_async().await {
        match event {
            FileEvent::Changed(_) => {
                if let Err(err) = document.reload(&provider).await {
                    warn!(error = %err, "reload failed; keeping last frame");
                    continue;
                }
                let Some(adapter) = document.adapter() else {
                    continue;
                };
                view.reload(adapter);
                if let Some(needle) = search {
                    highlight_search(view, needle)?;
                }
                write_frame(view, out)?;
                save_state(view, store);
            }
            FileEvent::Removed(path) => {
                warn!(path = %path.display(), "watched file was removed");
            }
        }
    }
    Ok(())
}

fn save_state(view: &DocumentView, store: &FileStateStore) {
    let Some(document) = view.document() else {
        return;
    };
    if let Err(err) = store.save(document.info(), &view.persisted_state()) {
        warn!(error = %err, "failed to save view state");
    }
}

fn to_rgba(image: &RenderImage) -> Result<RgbaImage> {
    RgbaImage::from_raw(image.width, image.height, image.pixels.to_vec())
        .ok_or_else(|| anyhow!("rendered bitmap has an inconsistent size"))
}

fn save_png(image: RgbaImage, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    image
        .save(out)
        .with_context(|| format!("failed to write {:?}", out))
}

fn parse_viewport(value: &str) -> Result<(i32, i32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<i32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("invalid viewport dimension {part:?}"))
    };
    Ok((parse(width)?, parse(height)?))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    use docview_core::{document_id_for_path, DocumentInfo, DocumentMetadata, RectF, SizeF};

    #[test]
    fn viewport_parses_width_and_height() {
        assert_eq!(parse_viewport("800x600"), Ok((800, 600)));
        assert_eq!(parse_viewport("1024X768"), Ok((1024, 768)));
        assert!(parse_viewport("800").is_err());
        assert!(parse_viewport("0x600").is_err());
    }

    #[test]
    fn layout_names_map_to_page_layouts() {
        assert_eq!(PageLayout::from(LayoutArg::Book), PageLayout::BookView);
        assert_eq!(ZoomMode::from(ZoomArg::FitPage), ZoomMode::FitInView);
    }

    /// One text line per page; each occurrence is a 10pt wide hit.
    struct TextPages {
        info: DocumentInfo,
        pages: Vec<&'static str>,
    }

    impl TextPages {
        fn new(pages: Vec<&'static str>) -> Arc<dyn DocumentAdapter> {
            let path = Path::new("/tmp/pages.pdf");
            Arc::new(Self {
                info: DocumentInfo {
                    id: document_id_for_path(path),
                    path: path.to_path_buf(),
                    page_count: pages.len(),
                    page_sizes: vec![SizeF::new(612.0, 792.0); pages.len()],
                    metadata: DocumentMetadata::default(),
                },
                pages,
            })
        }
    }

    impl DocumentAdapter for TextPages {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(
            &self,
            _page_index: usize,
            _size: PixelSize,
            _options: RenderOptions,
        ) -> Result<RenderImage> {
            Ok(RenderImage::empty())
        }

        fn extract_text(&self, page_index: usize, _region: Option<RectF>) -> Result<String> {
            Ok(self.pages[page_index].to_owned())
        }

        fn search_page(
            &self,
            page_index: usize,
            needle: &str,
            _options: RenderOptions,
        ) -> Result<Vec<RectF>> {
            Ok(self.pages[page_index]
                .match_indices(needle)
                .map(|(offset, _)| RectF::new(offset as f64 * 10.0, 0.0, 10.0, 12.0))
                .collect())
        }

        fn thumbnail(&self, _page_index: usize) -> Result<RenderImage> {
            Ok(RenderImage::empty())
        }
    }

    #[tokio::test]
    async fn search_rejects_a_start_page_past_the_end() {
        let config = ViewerConfig::default();
        let document = TextPages::new(vec!["foo", "bar"]);
        let err = search_document(&config, document, "foo", 2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("page 2 out of range"));
    }

    #[tokio::test]
    async fn search_of_an_empty_document_fails_instead_of_waiting() {
        let config = ViewerConfig::default();
        let document = TextPages::new(Vec::new());
        assert!(search_document(&config, document, "foo", 0).await.is_err());
    }

    #[tokio::test]
    async fn search_rejects_an_empty_needle() {
        let config = ViewerConfig::default();
        let document = TextPages::new(vec!["foo"]);
        let err = search_document(&config, document, "", 0).await.unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[tokio::test]
    async fn search_runs_to_completion_from_any_page() {
        let config = ViewerConfig::default();
        let document = TextPages::new(vec!["foo", "bar", "foo foo"]);
        search_document(&config, document, "foo", 1).await.unwrap();
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
