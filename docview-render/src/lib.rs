//! Background page rendering with a bounded job count and a small bitmap cache.
//!
//! [`PageRenderer`] never blocks the caller: [`PageRenderer::request_page`]
//! answers with whatever bitmap is at hand and schedules the real one. Jobs run
//! on a rayon pool and hand their bitmap back over a channel; only the owner
//! touches the cache, when it drains that channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use docview_core::config::RenderConfig;
use docview_core::{CancellationToken, DocumentAdapter, PixelSize, RenderImage, RenderOptions};
use flume::{Receiver, Sender};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace, warn};

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::PdfiumProvider;

/// Logical timestamp of a render request. Later requests get larger ids.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// A fresh bitmap for the page is in the cache.
    PageRendered(usize),
}

#[derive(Debug, Clone)]
struct RenderTask {
    page: usize,
    size: PixelSize,
    options: RenderOptions,
    id: RequestId,
    token: CancellationToken,
}

struct Completion {
    page: usize,
    id: RequestId,
    image: RenderImage,
}

pub struct PageRenderer {
    document: Option<Arc<dyn DocumentAdapter>>,
    pool: ThreadPool,
    request_limit: usize,
    cache_limit: usize,
    /// Jobs handed to the pool that have not reported back, live or not.
    active: usize,
    running: HashMap<usize, RenderTask>,
    queue: VecDeque<RenderTask>,
    cache: HashMap<usize, RenderImage>,
    /// Cached pages in admission order; the front is evicted first.
    recency: VecDeque<usize>,
    next_id: RequestId,
    valid_from: RequestId,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    subscribers: Vec<Sender<RenderEvent>>,
}

impl PageRenderer {
    pub fn new(config: &RenderConfig) -> anyhow::Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.render_threads.max(1))
            .thread_name(|index| format!("docview-render-{index}"))
            .build()?;
        let (completion_tx, completion_rx) = flume::unbounded();
        Ok(Self {
            document: None,
            pool,
            request_limit: config.request_limit.max(1),
            cache_limit: config.cache_limit.max(1),
            active: 0,
            running: HashMap::new(),
            queue: VecDeque::new(),
            cache: HashMap::new(),
            recency: VecDeque::new(),
            next_id: 1,
            valid_from: 0,
            completion_tx,
            completion_rx,
            subscribers: Vec::new(),
        })
    }

    /// Events are delivered after the cache already holds the new bitmap.
    pub fn subscribe(&mut self) -> Receiver<RenderEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn set_document(&mut self, document: Option<Arc<dyn DocumentAdapter>>) {
        self.document = document;
        self.invalidate_all();
    }

    /// The file changed on disk; drop everything rendered from the old copy.
    pub fn reload(&mut self) {
        self.invalidate_all();
    }

    /// Best bitmap available right now for `page` at `size`.
    ///
    /// Returns the cached bitmap when it already has the requested size.
    /// Otherwise a render is scheduled (unless one for the same size is
    /// pending) and the stale bitmap stretched to `size` is returned, or an
    /// empty image when nothing was cached yet.
    pub fn request_page(
        &mut self,
        page: usize,
        size: PixelSize,
        options: RenderOptions,
    ) -> RenderImage {
        let Some(document) = self.document.as_ref() else {
            return RenderImage::empty();
        };
        if page >= document.page_count() || size.is_empty() {
            return RenderImage::empty();
        }

        if let Some(image) = self.cache.get(&page) {
            if image.size() == size {
                trace!(page, "cache hit");
                return image.clone();
            }
        }

        if let Some(pending_size) = self.pending_size(page) {
            if pending_size == size {
                return self.stale_image(page, size);
            }
            debug!(page, ?pending_size, ?size, "superseding render for a new size");
            self.cancel_pending(page);
        }

        let task = RenderTask {
            page,
            size,
            options,
            id: self.issue_id(),
            token: CancellationToken::new(),
        };
        if self.active < self.request_limit {
            self.start(task);
        } else {
            trace!(page, queued = self.queue.len() + 1, "render queued");
            self.queue.push_back(task);
        }

        self.stale_image(page, size)
    }

    /// Handles every completion that has already arrived. Returns how many.
    pub fn process_completions(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.complete(completion);
            handled += 1;
        }
        handled
    }

    /// Blocks up to `timeout` for one completion, then drains the rest.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        match self.completion_rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.complete(completion);
                self.process_completions();
                true
            }
            Err(_) => false,
        }
    }

    pub fn cached(&self, page: usize) -> Option<&RenderImage> {
        self.cache.get(&page)
    }

    pub fn is_pending(&self, page: usize) -> bool {
        self.pending_size(page).is_some()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.running.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Jobs occupying a slot, including invalidated ones still running.
    pub fn active_jobs(&self) -> usize {
        self.active
    }

    pub fn has_pending_work(&self) -> bool {
        self.active > 0 || !self.queue.is_empty()
    }

    fn issue_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn pending_size(&self, page: usize) -> Option<PixelSize> {
        self.running
            .get(&page)
            .map(|task| task.size)
            .or_else(|| {
                self.queue
                    .iter()
                    .find(|task| task.page == page)
                    .map(|task| task.size)
            })
    }

    fn cancel_pending(&mut self, page: usize) {
        // a running job keeps its slot until it reports back
        if let Some(task) = self.running.remove(&page) {
            task.token.cancel();
        }
        self.queue.retain(|task| {
            if task.page == page {
                task.token.cancel();
                false
            } else {
                true
            }
        });
    }

    fn invalidate_all(&mut self) {
        for task in self.running.values() {
            task.token.cancel();
        }
        for task in &self.queue {
            task.token.cancel();
        }
        self.running.clear();
        self.queue.clear();
        self.cache.clear();
        self.recency.clear();
        self.valid_from = self.next_id;
        debug!(valid_from = self.valid_from, "render state invalidated");
    }

    fn stale_image(&self, page: usize, size: PixelSize) -> RenderImage {
        match self.cache.get(&page) {
            Some(image) if !image.is_empty() => scale_image(image, size),
            _ => RenderImage::empty(),
        }
    }

    fn start(&mut self, task: RenderTask) {
        let Some(document) = self.document.clone() else {
            return;
        };
        self.active += 1;
        self.running.insert(task.page, task.clone());
        trace!(page = task.page, id = task.id, active = self.active, "render started");

        let tx = self.completion_tx.clone();
        self.pool.spawn(move || {
            let image = if task.token.is_cancelled() {
                RenderImage::empty()
            } else {
                // adapters take the unrotated size and turn the output themselves
                let target = task.options.rotation.apply_to_pixels(task.size);
                let image = document
                    .render_page(task.page, target, task.options)
                    .unwrap_or_else(|err| {
                        warn!(page = task.page, error = %err, "page render failed");
                        RenderImage::empty()
                    });
                // cache hits compare exact sizes
                if image.is_empty() || image.size() == task.size {
                    image
                } else {
                    debug!(page = task.page, got = ?image.size(), want = ?task.size, "resizing rendered page");
                    scale_image(&image, task.size)
                }
            };
            let _ = tx.send(Completion {
                page: task.page,
                id: task.id,
                image,
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { page, id, image } = completion;
        self.active = self.active.saturating_sub(1);

        let live = self.running.get(&page).is_some_and(|task| task.id == id);
        if live {
            self.running.remove(&page);
        }

        if live && id >= self.valid_from {
            self.admit(page, image);
            self.notify(RenderEvent::PageRendered(page));
        } else {
            trace!(page, id, valid_from = self.valid_from, "stale render discarded");
        }

        self.start_queued();
    }

    fn admit(&mut self, page: usize, image: RenderImage) {
        if !self.cache.contains_key(&page) {
            if self.recency.len() >= self.cache_limit {
                if let Some(evicted) = self.recency.pop_front() {
                    self.cache.remove(&evicted);
                    trace!(page = evicted, "evicted from cache");
                }
            }
            self.recency.push_back(page);
        }
        self.cache.insert(page, image);
    }

    fn start_queued(&mut self) {
        while self.active < self.request_limit {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.start(task);
        }
    }

    fn notify(&mut self, event: RenderEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

/// Stretches `image` to `size` with a triangle filter.
pub fn scale_image(image: &RenderImage, size: PixelSize) -> RenderImage {
    if image.size() == size {
        return image.clone();
    }
    let Some(source) = RgbaImage::from_raw(image.width, image.height, image.pixels.to_vec())
    else {
        return RenderImage::empty();
    };
    let scaled = imageops::resize(&source, size.width, size.height, FilterType::Triangle);
    RenderImage::new(scaled.width(), scaled.height(), scaled.into_raw())
}
