//! The scrollable document surface: ties layout, navigation, the page renderer
//! and the search engine together and composites frames.

use std::sync::Arc;

use anyhow::Result;
use docview_core::config::{ViewConfig, ViewerConfig};
use docview_core::layout::{self, DocumentLayout, LayoutSettings, PageLayout, ZoomMode};
use docview_core::navigation::{Navigation, NavigationEvent};
use docview_core::state::PersistedViewState;
use docview_core::transform::{hit_to_page_pixels, HitPadding};
use docview_core::{DocumentAdapter, PixelSize, Rect, RectF, RenderOptions};
use docview_render::{PageRenderer, RenderEvent};
use docview_search::{SearchCursor, SearchEngine, SearchEvent, SearchHighlights};
use flume::Receiver;
use image::{imageops, Rgba, RgbaImage};
use tracing::{debug, trace};

pub mod watch;

pub use watch::{FileEvent, FileWatcher};

const BACKGROUND: Rgba<u8> = Rgba([128, 128, 128, 255]);
const OTHER_HIT_COLOR: [u8; 3] = [255, 200, 0];
const CURRENT_HIT_COLOR: [u8; 3] = [255, 235, 0];

pub fn layout_settings(config: &ViewConfig) -> LayoutSettings {
    LayoutSettings {
        page_layout: config.page_layout,
        zoom_mode: config.zoom_mode,
        zoom_factor: config.zoom_factor,
        continuous: config.continuous,
        page_spacing: config.page_spacing,
        margins: config.margins,
        screen_resolution: config.screen_resolution,
        ..LayoutSettings::default()
    }
}

/// What changed during a [`DocumentView::pump`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewUpdate {
    pub rendered_pages: Vec<usize>,
    pub result_pages: Vec<usize>,
    pub match_count: Option<usize>,
    pub search_complete: bool,
}

impl ViewUpdate {
    pub fn needs_repaint(&self) -> bool {
        !self.rendered_pages.is_empty() || !self.result_pages.is_empty()
    }
}

pub struct DocumentView {
    document: Option<Arc<dyn DocumentAdapter>>,
    settings: LayoutSettings,
    options: RenderOptions,
    layout: DocumentLayout,
    /// Visible part of the scroll area, in scroll-area pixels.
    viewport: Rect,
    navigation: Navigation,
    renderer: PageRenderer,
    render_events: Receiver<RenderEvent>,
    search: SearchEngine,
    search_events: Receiver<SearchEvent>,
    cursor: SearchCursor,
    searching: bool,
    match_count: usize,
}

impl DocumentView {
    pub fn new(config: &ViewerConfig) -> Result<Self> {
        let mut renderer = PageRenderer::new(&config.render)?;
        let render_events = renderer.subscribe();
        let search = SearchEngine::new(&config.search)?;
        let search_events = search.subscribe();
        Ok(Self {
            document: None,
            settings: layout_settings(&config.view),
            options: RenderOptions::default(),
            layout: DocumentLayout::default(),
            viewport: Rect::default(),
            navigation: Navigation::new(),
            renderer,
            render_events,
            search,
            search_events,
            cursor: SearchCursor::new(),
            searching: false,
            match_count: 0,
        })
    }

    pub fn set_document(&mut self, document: Option<Arc<dyn DocumentAdapter>>) {
        let page_count = document.as_ref().map_or(0, |doc| doc.page_count());
        self.document = document.clone();
        self.renderer.set_document(document.clone());
        self.search.set_document(document);
        self.cursor.clear();
        self.searching = false;
        self.match_count = 0;
        self.navigation.reset(page_count);
        self.viewport.y = 0;
        self.relayout();
        debug!(pages = page_count, "view document set");
    }

    /// Swaps in `document` re-read from the same file after it changed on disk.
    ///
    /// The current page (clamped to the new page count) and the needle
    /// survive. Old hits are dropped and the search runs again.
    pub fn reload(&mut self, document: Arc<dyn DocumentAdapter>) {
        let page = self.navigation.current_page();
        let needle = self.search.needle();
        let page_count = document.page_count();

        self.document = Some(Arc::clone(&document));
        self.renderer.set_document(Some(Arc::clone(&document)));
        self.search.set_document(Some(document));
        // hits still queued belong to the old copy
        while self.search_events.try_recv().is_ok() {}
        self.cursor.clear();
        self.searching = false;
        self.match_count = 0;
        if self.navigation.page_count() != page_count {
            self.navigation.reset(page_count);
        }
        self.navigation.set_current_page(page);
        self.relayout_keeping_page();
        debug!(pages = page_count, page = self.current_page(), "view document reloaded");

        if !needle.is_empty() {
            self.search_text(&needle);
        }
    }

    pub fn document(&self) -> Option<&Arc<dyn DocumentAdapter>> {
        self.document.as_ref()
    }

    pub fn page_count(&self) -> usize {
        self.document.as_ref().map_or(0, |doc| doc.page_count())
    }

    pub fn current_page(&self) -> usize {
        self.navigation.current_page()
    }

    pub fn layout(&self) -> &DocumentLayout {
        &self.layout
    }

    pub fn viewport(&self) -> Rect {
        self.viewport
    }

    pub fn settings(&self) -> &LayoutSettings {
        &self.settings
    }

    pub fn render_options(&self) -> RenderOptions {
        self.options
    }

    pub fn renderer(&self) -> &PageRenderer {
        &self.renderer
    }

    pub fn cursor(&self) -> &SearchCursor {
        &self.cursor
    }

    pub fn match_count(&self) -> usize {
        self.match_count
    }

    pub fn set_viewport(&mut self, width: i32, height: i32) {
        self.viewport.width = width.max(0);
        self.viewport.height = height.max(0);
        self.relayout();
    }

    /// Scrolls to `y` (clamped) and updates the current page.
    pub fn scroll_to(&mut self, y: i32) {
        let max_y = (self.layout.document_size.height as i32 - self.viewport.height).max(0);
        self.viewport.y = y.clamp(0, max_y);
        if self.settings.continuous {
            if let Some(page) = self.layout.current_page_at(&self.viewport) {
                self.navigation.set_current_page(page);
            }
        }
    }

    pub fn go_to_page(&mut self, page: usize) {
        self.navigation.go_to(page);
        if self.settings.continuous {
            let y = self.layout.y_position_for_page(self.navigation.current_page());
            self.scroll_to(y - self.settings.margins.top);
        } else {
            self.viewport.y = 0;
            self.relayout();
        }
    }

    pub fn set_zoom_factor(&mut self, zoom: f64) {
        if !(zoom.is_finite() && zoom > 0.0) {
            return;
        }
        self.settings.zoom_mode = ZoomMode::CustomZoom;
        self.settings.zoom_factor = zoom;
        self.relayout_keeping_page();
    }

    pub fn set_zoom_mode(&mut self, mode: ZoomMode) {
        self.settings.zoom_mode = mode;
        self.relayout_keeping_page();
    }

    pub fn set_page_layout(&mut self, page_layout: PageLayout) {
        self.settings.page_layout = page_layout;
        self.relayout_keeping_page();
    }

    pub fn set_continuous(&mut self, continuous: bool) {
        self.settings.continuous = continuous;
        self.relayout_keeping_page();
    }

    /// Different options invalidate every rendered bitmap.
    pub fn set_render_options(&mut self, options: RenderOptions) {
        if options == self.options {
            return;
        }
        self.options = options;
        self.settings.rotation = options.rotation;
        self.renderer.reload();
        self.relayout_keeping_page();
    }

    /// Starts a search at the current page. An empty `text` clears the search.
    pub fn search_text(&mut self, text: &str) {
        if text.is_empty() {
            self.clear_search();
            return;
        }
        let unchanged = self.search.needle() == text.to_lowercase();
        if !unchanged {
            self.cursor.clear();
            self.match_count = 0;
            self.searching = true;
        }
        self.search.set_search_string(text);
        self.search.search_page(self.navigation.current_page());
    }

    pub fn clear_search(&mut self) {
        self.search.set_search_string("");
        self.cursor.clear();
        self.searching = false;
        self.match_count = 0;
    }

    pub fn search(&self) -> &SearchEngine {
        &self.search
    }

    pub fn highlight_next(&mut self) -> Option<usize> {
        let page = if self.cursor.current_page().is_none() {
            self.cursor
                .highlight_first_from(self.navigation.current_page())
        } else {
            self.cursor.next()
        }?;
        self.go_to_page(page);
        Some(page)
    }

    pub fn highlight_previous(&mut self) -> Option<usize> {
        let page = self.cursor.previous()?;
        self.go_to_page(page);
        Some(page)
    }

    /// Drains finished renders, search events and page changes.
    pub fn pump(&mut self) -> ViewUpdate {
        let mut update = ViewUpdate::default();

        self.renderer.process_completions();
        for RenderEvent::PageRendered(page) in self.render_events.try_iter() {
            update.rendered_pages.push(page);
        }

        for event in self.search_events.try_iter() {
            match event {
                SearchEvent::ResultsReady(page, rects) => {
                    self.cursor.add_page(page, rects);
                    update.result_pages.push(page);
                }
                SearchEvent::MatchesFound(count) => {
                    self.match_count = count;
                    update.match_count = Some(count);
                }
                SearchEvent::SearchComplete(count) => {
                    self.match_count = count;
                    self.searching = false;
                    update.match_count = Some(count);
                    update.search_complete = true;
                }
            }
        }

        for event in self.navigation.drain_events() {
            if let NavigationEvent::CurrentPageChanged(page) = event {
                if self.searching {
                    trace!(page, "prioritising current page in search");
                    self.search.search_page(page);
                }
            }
        }

        update
    }

    /// Composites the visible pages and their search highlights.
    pub fn paint(&mut self) -> RgbaImage {
        let width = self.viewport.width.max(0) as u32;
        let height = self.viewport.height.max(0) as u32;
        let mut frame = RgbaImage::from_pixel(width, height, BACKGROUND);

        for page in self.layout.visible_pages(&self.viewport) {
            let Some(rect) = self.layout.geometry(page) else {
                continue;
            };
            let size = rect.size();
            let image = self.renderer.request_page(page, size, self.options);
            let Some(mut bitmap) = RgbaImage::from_raw(image.width, image.height, image.pixels.to_vec())
            else {
                continue;
            };
            if bitmap.width() == 0 || bitmap.height() == 0 {
                continue;
            }

            let highlights = self.cursor.highlights(page);
            if !highlights.is_empty() {
                self.apply_highlights(&mut bitmap, page, &highlights);
            }

            let x = (rect.x - self.viewport.x) as i64;
            let y = (rect.y - self.viewport.y) as i64;
            imageops::overlay(&mut frame, &bitmap, x, y);
        }
        frame
    }

    pub fn persisted_state(&self) -> PersistedViewState {
        PersistedViewState {
            current_page: self.navigation.current_page(),
            zoom_factor: self.settings.zoom_factor,
            zoom_mode: self.settings.zoom_mode,
            page_layout: self.settings.page_layout,
            rotation: self.options.rotation,
            continuous: self.settings.continuous,
        }
    }

    pub fn restore_state(&mut self, state: &PersistedViewState) {
        self.settings.zoom_factor = state.zoom_factor;
        self.settings.zoom_mode = state.zoom_mode;
        self.settings.page_layout = state.page_layout;
        self.settings.continuous = state.continuous;
        self.set_render_options(self.options.with_rotation(state.rotation));
        self.relayout();
        self.go_to_page(state.current_page);
    }

    fn apply_highlights(&self, bitmap: &mut RgbaImage, page: usize, highlights: &SearchHighlights) {
        let Some(page_size) = self.document.as_ref().and_then(|doc| doc.page_size(page)) else {
            return;
        };
        let rendered = PixelSize::new(bitmap.width(), bitmap.height());
        let to_pixels = |hit: RectF| {
            hit_to_page_pixels(
                hit,
                page_size,
                rendered,
                self.options.rotation,
                HitPadding::default(),
            )
        };
        for rect in highlights.others.iter().filter_map(|hit| to_pixels(*hit)) {
            fill_rect(bitmap, rect, OTHER_HIT_COLOR, 0.2);
        }
        if let Some(rect) = highlights.current.and_then(to_pixels) {
            fill_rect(bitmap, rect, CURRENT_HIT_COLOR, 0.35);
        }
    }

    fn relayout(&mut self) {
        let page_sizes = self
            .document
            .as_ref()
            .map(|doc| doc.info().page_sizes.clone())
            .unwrap_or_default();
        self.layout = layout::compute(
            &self.settings,
            &page_sizes,
            self.navigation.current_page(),
            &self.viewport,
        );
        let max_y = (self.layout.document_size.height as i32 - self.viewport.height).max(0);
        self.viewport.y = self.viewport.y.clamp(0, max_y);
    }

    fn relayout_keeping_page(&mut self) {
        let page = self.navigation.current_page();
        self.relayout();
        self.go_to_page(page);
    }
}

fn fill_rect(image: &mut RgbaImage, rect: RectF, color: [u8; 3], alpha: f32) {
    let x0 = rect.x.floor().max(0.0) as u32;
    let y0 = rect.y.floor().max(0.0) as u32;
    let x1 = (rect.right().ceil().max(0.0) as u32).min(image.width());
    let y1 = (rect.bottom().ceil().max(0.0) as u32).min(image.height());
    for y in y0..y1 {
        for x in x0..x1 {
            blend_pixel(image.get_pixel_mut(x, y), color, alpha);
        }
    }
}

fn blend_pixel(pixel: &mut Rgba<u8>, color: [u8; 3], alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let inv = 1.0 - alpha;
    for (channel, target) in pixel.0.iter_mut().zip(color) {
        *channel = ((*channel as f32 * inv) + (target as f32 * alpha))
            .round()
            .clamp(0.0, 255.0) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::time::{Duration, Instant};

    use docview_core::state::{MemoryStateStore, StateStore};
    use docview_core::{
        document_id_for_path, DocumentInfo, DocumentMetadata, RenderImage, Rotation, SizeF,
    };

    /// Solid pages tinted by index; every page has one hit in its top-left corner.
    struct SolidDocument {
        info: DocumentInfo,
    }

    impl SolidDocument {
        fn new(pages: usize) -> Arc<Self> {
            let path = Path::new("/tmp/solid.pdf");
            Arc::new(Self {
                info: DocumentInfo {
                    id: document_id_for_path(path),
                    path: path.to_path_buf(),
                    page_count: pages,
                    page_sizes: vec![SizeF::new(100.0, 200.0); pages],
                    metadata: DocumentMetadata::default(),
                },
            })
        }

        fn color(page: usize) -> [u8; 4] {
            [0, 0, (page as u8).wrapping_mul(40), 255]
        }
    }

    impl DocumentAdapter for SolidDocument {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(
            &self,
            page_index: usize,
            size: PixelSize,
            options: RenderOptions,
        ) -> Result<RenderImage> {
            let size = options.rotation.apply_to_pixels(size);
            let pixels = Self::color(page_index)
                .repeat(size.width as usize * size.height as usize);
            Ok(RenderImage::new(size.width, size.height, pixels))
        }

        fn extract_text(&self, _page_index: usize, _region: Option<RectF>) -> Result<String> {
            Ok("x".into())
        }

        fn search_page(
            &self,
            _page_index: usize,
            _needle: &str,
            _options: RenderOptions,
        ) -> Result<Vec<RectF>> {
            Ok(vec![RectF::new(10.0, 10.0, 20.0, 10.0)])
        }

        fn thumbnail(&self, _page_index: usize) -> Result<RenderImage> {
            Ok(RenderImage::empty())
        }
    }

    fn test_config() -> ViewerConfig {
        let mut config = ViewerConfig::default();
        config.view.screen_resolution = 1.0;
        config
    }

    fn view_with(pages: usize) -> DocumentView {
        let mut view = DocumentView::new(&test_config()).unwrap();
        view.set_viewport(200, 300);
        let document: Arc<dyn DocumentAdapter> = SolidDocument::new(pages);
        view.set_document(Some(document));
        view
    }

    fn pump_until(view: &mut DocumentView, done: impl Fn(&DocumentView, &ViewUpdate) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let update = view.pump();
            if done(view, &update) {
                return;
            }
            assert!(Instant::now() < deadline, "view never settled");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn paint_settled(view: &mut DocumentView) -> RgbaImage {
        view.paint();
        pump_until(view, |v, _| !v.renderer().has_pending_work());
        view.paint()
    }

    #[test]
    fn paint_places_pages_at_their_geometry() {
        let mut view = view_with(3);
        assert_eq!(view.layout().geometry(0), Some(Rect::new(50, 6, 100, 200)));

        let frame = paint_settled(&mut view);
        assert_eq!(frame.dimensions(), (200, 300));
        assert_eq!(frame.get_pixel(10, 10), &BACKGROUND);
        assert_eq!(frame.get_pixel(100, 100).0, SolidDocument::color(0));
        // page 1 starts at 209
        assert_eq!(frame.get_pixel(100, 250).0, SolidDocument::color(1));
    }

    #[test]
    fn scrolling_moves_the_current_page() {
        let mut view = view_with(5);
        view.scroll_to(420);
        assert_eq!(view.current_page(), 2);
        view.scroll_to(-50);
        assert_eq!(view.viewport().y, 0);
        assert_eq!(view.current_page(), 0);

        view.go_to_page(4);
        assert_eq!(view.current_page(), 4);
        let bottom = view.layout().document_size.height as i32 - 300;
        assert_eq!(view.viewport().y, bottom);
    }

    #[test]
    fn rotation_reloads_the_renderer_and_transposes_the_layout() {
        let mut view = view_with(2);
        paint_settled(&mut view);
        assert!(view.renderer().cache_len() > 0);

        view.set_render_options(RenderOptions::default().with_rotation(Rotation::Rotate90));
        assert_eq!(view.render_options().rotation, Rotation::Rotate90);
        assert_eq!(view.settings().rotation, Rotation::Rotate90);
        assert_eq!(view.renderer().cache_len(), 0);
        let rect = view.layout().geometry(0).unwrap();
        assert_eq!((rect.width, rect.height), (200, 100));

        paint_settled(&mut view);
        let cached = view.renderer().cached(0).map(RenderImage::size);
        assert_eq!(cached, Some(PixelSize::new(200, 100)));
    }

    #[test]
    fn search_hits_are_highlighted_and_navigable() {
        let mut view = view_with(3);
        view.search_text("x");
        pump_until(&mut view, |_, update| update.search_complete);
        assert_eq!(view.match_count(), 3);
        assert_eq!(view.cursor().total(), 3);

        assert_eq!(view.highlight_next(), Some(0));
        let frame = paint_settled(&mut view);
        // hit at (10,10)-(30,20) on page 0, drawn at page origin (50,6)
        let inside = frame.get_pixel(50 + 15, 6 + 15).0;
        assert_ne!(inside, SolidDocument::color(0));
        assert_eq!(frame.get_pixel(50 + 80, 6 + 150).0, SolidDocument::color(0));

        assert_eq!(view.highlight_next(), Some(1));
        assert_eq!(view.current_page(), 1);
        assert_eq!(view.highlight_previous(), Some(0));

        view.clear_search();
        assert_eq!(view.cursor().total(), 0);
    }

    #[test]
    fn reload_keeps_the_page_and_searches_again() {
        let mut view = view_with(4);
        view.search_text("x");
        pump_until(&mut view, |_, update| update.search_complete);
        assert_eq!(view.match_count(), 4);
        view.go_to_page(3);
        paint_settled(&mut view);

        let shorter: Arc<dyn DocumentAdapter> = SolidDocument::new(2);
        view.reload(shorter);
        assert_eq!(view.page_count(), 2);
        assert_eq!(view.current_page(), 1);
        assert_eq!(view.renderer().cache_len(), 0);
        assert_eq!(view.cursor().total(), 0);
        assert_eq!(view.search().needle(), "x");

        pump_until(&mut view, |_, update| update.search_complete);
        assert_eq!(view.match_count(), 2);
        assert_eq!(view.cursor().total(), 2);
        let frame = paint_settled(&mut view);
        assert_eq!(frame.dimensions(), (200, 300));
    }

    #[test]
    fn view_state_survives_a_round_trip() {
        let mut view = view_with(10);
        view.set_zoom_factor(1.5);
        view.set_page_layout(PageLayout::FacingPages);
        view.go_to_page(6);
        let state = view.persisted_state();

        let store = MemoryStateStore::new();
        let document = SolidDocument::new(10);
        store.save(document.info(), &state).unwrap();

        let mut restored = view_with(10);
        let loaded = store.load(document.info()).unwrap().unwrap();
        restored.restore_state(&loaded);
        assert_eq!(restored.persisted_state(), state);
        assert_eq!(restored.current_page(), 6);
    }
}
