//! Incremental whole-document text search on a background thread.
//!
//! Pages the user asks for are searched first, most recent request first. The
//! worker then walks forward from the page the search started on, wraps around
//! to the beginning, and reports once every page has been searched. Asking for
//! another page mid-walk restarts the walk from that page without throwing away
//! what was already found.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use docview_core::config::SearchConfig;
use docview_core::{CancellationToken, DocumentAdapter, RectF, RenderOptions};
use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

mod cursor;

pub use cursor::{SearchCursor, SearchHighlights};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    /// Hits for one page, in unrotated page points. Only sent for pages with hits.
    ResultsReady(usize, Vec<RectF>),
    /// Running total of hits in the session.
    MatchesFound(usize),
    /// Every page has been searched.
    SearchComplete(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchState {
    #[default]
    Idle,
    Running,
    StoppingForRestart,
    Stopped,
}

#[derive(Default)]
struct Session {
    document: Option<Arc<dyn DocumentAdapter>>,
    needle: String,
    /// Explicitly requested pages; the last one is searched first.
    queued: Vec<usize>,
    start_page: Option<usize>,
    results: HashMap<usize, Vec<RectF>>,
    match_count: usize,
    completed: bool,
    token: CancellationToken,
    state: SearchState,
    /// A pass is wanted.
    pending: bool,
    /// The worker is inside a pass.
    busy: bool,
    /// The running pass should start over from the newest requested page.
    restart: bool,
    shutdown: bool,
    subscribers: Vec<Sender<SearchEvent>>,
}

impl Session {
    fn emit(&mut self, event: SearchEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn reset(&mut self) {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.queued.clear();
        self.results.clear();
        self.start_page = None;
        self.match_count = 0;
        self.completed = false;
        self.restart = false;
        self.pending = false;
        self.state = SearchState::Idle;
        self.emit(SearchEvent::MatchesFound(0));
    }
}

struct Shared {
    session: Mutex<Session>,
    wake: Condvar,
}

enum PassOutcome {
    Finished,
    Cancelled,
    Restart,
}

pub struct SearchEngine {
    shared: Arc<Shared>,
    case_sensitive: bool,
    worker: Option<JoinHandle<()>>,
}

impl SearchEngine {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::default()),
            wake: Condvar::new(),
        });
        let worker = thread::Builder::new()
            .name("docview-search".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || worker_loop(&shared)
            })?;
        Ok(Self {
            shared,
            case_sensitive: config.case_sensitive,
            worker: Some(worker),
        })
    }

    pub fn subscribe(&self) -> Receiver<SearchEvent> {
        let (tx, rx) = flume::unbounded();
        self.shared.session.lock().subscribers.push(tx);
        rx
    }

    /// Drops the needle and every result, and searches `document` from now on.
    pub fn set_document(&self, document: Option<Arc<dyn DocumentAdapter>>) {
        let mut session = self.shared.session.lock();
        session.needle.clear();
        session.reset();
        session.document = document;
        debug!("search document replaced");
    }

    /// Setting the needle already in use keeps the session and repeats its
    /// count: as `SearchComplete` once the session completed, otherwise as
    /// `MatchesFound` so completion is still reported exactly once.
    pub fn set_search_string(&self, text: &str) {
        let needle = if self.case_sensitive {
            text.to_owned()
        } else {
            text.to_lowercase()
        };
        let mut session = self.shared.session.lock();
        if session.needle == needle {
            let count = session.match_count;
            let event = if session.completed {
                SearchEvent::SearchComplete(count)
            } else {
                SearchEvent::MatchesFound(count)
            };
            session.emit(event);
            return;
        }
        session.reset();
        debug!(needle = %needle, "search needle changed");
        session.needle = needle;
    }

    /// Searches `page` ahead of everything else.
    ///
    /// Ignored for pages already queued or searched, pages out of range, and
    /// while there is no document or needle.
    pub fn search_page(&self, page: usize) {
        let mut session = self.shared.session.lock();
        let Some(page_count) = session.document.as_ref().map(|doc| doc.page_count()) else {
            return;
        };
        if page >= page_count
            || session.needle.is_empty()
            || session.queued.contains(&page)
            || session.results.contains_key(&page)
        {
            return;
        }

        if session.start_page.is_none() {
            session.start_page = Some(page);
        }
        session.queued.push(page);
        if session.token.is_cancelled() {
            session.token = CancellationToken::new();
        }

        if session.busy {
            session.restart = true;
            session.state = SearchState::StoppingForRestart;
        } else {
            session.state = SearchState::Running;
        }
        session.pending = true;
        trace!(page, "page queued for search");
        drop(session);
        self.shared.wake.notify_one();
    }

    /// Hits found on `page` so far; empty when it has not been searched.
    pub fn results(&self, page: usize) -> Vec<RectF> {
        self.shared
            .session
            .lock()
            .results
            .get(&page)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_searched(&self, page: usize) -> bool {
        self.shared.session.lock().results.contains_key(&page)
    }

    pub fn match_count(&self) -> usize {
        self.shared.session.lock().match_count
    }

    pub fn needle(&self) -> String {
        self.shared.session.lock().needle.clone()
    }

    pub fn state(&self) -> SearchState {
        self.shared.session.lock().state
    }

    /// Cancels the pass in progress. A later [`Self::search_page`] resumes.
    pub fn stop(&self) {
        let mut session = self.shared.session.lock();
        session.token.cancel();
        session.pending = false;
        session.restart = false;
        session.state = SearchState::Stopped;
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        {
            let mut session = self.shared.session.lock();
            session.shutdown = true;
            session.token.cancel();
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("search worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    let mut session = shared.session.lock();
    loop {
        while !session.pending && !session.shutdown {
            shared.wake.wait(&mut session);
        }
        if session.shutdown {
            break;
        }
        session.pending = false;

        if session.restart {
            session.restart = false;
            if let Some(&newest) = session.queued.last() {
                session.start_page = Some(newest);
            }
        }
        let Some(document) = session.document.clone() else {
            continue;
        };
        let pass = Pass {
            shared,
            document,
            needle: session.needle.clone(),
            token: session.token.clone(),
        };
        session.busy = true;
        session.state = SearchState::Running;

        let outcome = MutexGuard::unlocked(&mut session, || pass.run());

        session.busy = false;
        match outcome {
            PassOutcome::Restart => {
                debug!(start = ?session.queued.last(), "search restarting");
                session.pending = true;
            }
            PassOutcome::Finished | PassOutcome::Cancelled => {
                if !session.pending && session.state != SearchState::Stopped {
                    session.state = SearchState::Idle;
                }
            }
        }
    }
}

struct Pass<'a> {
    shared: &'a Shared,
    document: Arc<dyn DocumentAdapter>,
    needle: String,
    token: CancellationToken,
}

impl Pass<'_> {
    fn run(&self) -> PassOutcome {
        // requested pages, newest first
        loop {
            let page = {
                let mut session = self.shared.session.lock();
                if self.token.is_cancelled() {
                    return PassOutcome::Cancelled;
                }
                match session.queued.pop() {
                    Some(page) if session.results.contains_key(&page) => continue,
                    Some(page) => page,
                    None => break,
                }
            };
            if !self.search(page) {
                return PassOutcome::Cancelled;
            }
        }

        let page_count = self.document.page_count();
        let start = self.shared.session.lock().start_page;
        let order = match start {
            Some(start) => (start + 1..page_count).chain(0..start.min(page_count)),
            None => (0..page_count).chain(0..0),
        };
        for page in order {
            {
                let session = self.shared.session.lock();
                if self.token.is_cancelled() {
                    return PassOutcome::Cancelled;
                }
                if session.restart {
                    return PassOutcome::Restart;
                }
                if session.results.contains_key(&page) {
                    continue;
                }
            }
            if !self.search(page) {
                return PassOutcome::Cancelled;
            }
        }

        let mut session = self.shared.session.lock();
        if self.token.is_cancelled() {
            return PassOutcome::Cancelled;
        }
        if session.results.len() >= page_count && !session.completed {
            session.completed = true;
            let count = session.match_count;
            debug!(matches = count, "search complete");
            session.emit(SearchEvent::SearchComplete(count));
        }
        session.start_page = None;
        PassOutcome::Finished
    }

    /// Searches one page and records it. Returns `false` once cancelled.
    fn search(&self, page: usize) -> bool {
        let hits = self
            .document
            .search_page(page, &self.needle, RenderOptions::default())
            .unwrap_or_else(|err| {
                warn!(page, error = %err, "page search failed");
                Vec::new()
            });

        let mut session = self.shared.session.lock();
        if self.token.is_cancelled() {
            return false;
        }
        session.match_count += hits.len();
        let found = !hits.is_empty();
        session.results.insert(page, hits.clone());
        if found {
            let count = session.match_count;
            session.emit(SearchEvent::MatchesFound(count));
            session.emit(SearchEvent::ResultsReady(page, hits));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;

    use docview_core::{
        document_id_for_path, DocumentInfo, DocumentMetadata, PixelSize, RenderImage, SizeF,
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// Plain-text pages; searching a page in `held` blocks until released.
    struct TextDocument {
        info: DocumentInfo,
        pages: Vec<String>,
        held: Mutex<HashSet<usize>>,
        released: Condvar,
        entered: Sender<usize>,
    }

    impl TextDocument {
        fn new(pages: &[&str]) -> (Arc<Self>, Receiver<usize>) {
            let path = Path::new("/tmp/text.pdf");
            let (entered, entered_rx) = flume::unbounded();
            let document = Arc::new(Self {
                info: DocumentInfo {
                    id: document_id_for_path(path),
                    path: path.to_path_buf(),
                    page_count: pages.len(),
                    page_sizes: vec![SizeF::new(100.0, 100.0); pages.len()],
                    metadata: DocumentMetadata::default(),
                },
                pages: pages.iter().map(|s| s.to_string()).collect(),
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
                entered,
            });
            (document, entered_rx)
        }

        fn hold(&self, page: usize) {
            self.held.lock().insert(page);
        }

        fn release(&self, page: usize) {
            self.held.lock().remove(&page);
            self.released.notify_all();
        }
    }

    impl DocumentAdapter for TextDocument {
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
            Ok(self.pages[page_index].clone())
        }

        fn search_page(
            &self,
            page_index: usize,
            needle: &str,
            _options: RenderOptions,
        ) -> Result<Vec<RectF>> {
            let _ = self.entered.send(page_index);
            {
                let mut held = self.held.lock();
                while held.contains(&page_index) {
                    self.released.wait(&mut held);
                }
            }
            let text = self.pages[page_index].to_lowercase();
            Ok(text
                .match_indices(needle)
                .map(|(offset, _)| RectF::new(offset as f64, 10.0, needle.len() as f64, 12.0))
                .collect())
        }

        fn thumbnail(&self, _page_index: usize) -> Result<RenderImage> {
            Ok(RenderImage::empty())
        }
    }

    fn engine_for(document: &Arc<TextDocument>) -> (SearchEngine, Receiver<SearchEvent>) {
        let engine = SearchEngine::new(&SearchConfig::default()).unwrap();
        let events = engine.subscribe();
        let adapter: Arc<dyn DocumentAdapter> = document.clone();
        engine.set_document(Some(adapter));
        (engine, events)
    }

    /// Events up to and including `SearchComplete`.
    fn collect_until_complete(events: &Receiver<SearchEvent>) -> Vec<SearchEvent> {
        let mut seen = Vec::new();
        loop {
            let event = events.recv_timeout(WAIT).expect("search never completed");
            let done = matches!(event, SearchEvent::SearchComplete(_));
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn result_pages(events: &[SearchEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|event| match event {
                SearchEvent::ResultsReady(page, _) => Some(*page),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn uninterrupted_run_scans_forward_then_wraps() {
        let (document, _) = TextDocument::new(&["a x", "b x", "c x", "d x", "e x", "f x"]);
        let (engine, events) = engine_for(&document);
        while events.try_recv().is_ok() {}

        engine.set_search_string("X");
        engine.search_page(2);
        let seen = collect_until_complete(&events);

        assert_eq!(seen.first(), Some(&SearchEvent::MatchesFound(0)));
        assert_eq!(result_pages(&seen), vec![2, 3, 4, 5, 0, 1]);
        assert_eq!(seen.last(), Some(&SearchEvent::SearchComplete(6)));
        for page in 0..6 {
            assert!(engine.is_searched(page));
        }
    }

    #[test]
    fn foo_on_two_of_five_pages() {
        let (document, _) =
            TextDocument::new(&["nothing", "here", "some foo text", "still none", "Foo again"]);
        let (engine, events) = engine_for(&document);

        engine.set_search_string("foo");
        engine.search_page(2);
        let seen = collect_until_complete(&events);

        assert_eq!(result_pages(&seen), vec![2, 4]);
        assert_eq!(
            seen.iter()
                .filter(|event| matches!(event, SearchEvent::SearchComplete(_)))
                .count(),
            1
        );
        assert_eq!(seen.last(), Some(&SearchEvent::SearchComplete(2)));
        assert_eq!(engine.results(2), vec![RectF::new(5.0, 10.0, 3.0, 12.0)]);
        assert!(engine.results(1).is_empty());
        assert!(engine.is_searched(1));
        assert_eq!(engine.state(), SearchState::Idle);
    }

    #[test]
    fn same_needle_keeps_results_and_repeats_the_count() {
        let (document, _) = TextDocument::new(&["foo", "bar", "foo foo"]);
        let (engine, events) = engine_for(&document);
        engine.set_search_string("foo");
        engine.search_page(0);
        collect_until_complete(&events);

        engine.set_search_string("FOO");
        assert_eq!(events.recv_timeout(WAIT), Ok(SearchEvent::SearchComplete(3)));
        assert_eq!(engine.results(2).len(), 2);
        assert_eq!(engine.match_count(), 3);
    }

    #[test]
    fn same_needle_mid_run_does_not_complete_early() {
        let (document, entered) = TextDocument::new(&["x"; 6]);
        let (engine, events) = engine_for(&document);
        document.hold(3);

        engine.set_search_string("x");
        engine.search_page(0);
        while entered.recv_timeout(WAIT).expect("search never reached page 3") != 3 {}
        engine.set_search_string("x");
        document.release(3);

        let seen = collect_until_complete(&events);
        let completions: Vec<_> = seen
            .iter()
            .filter(|event| matches!(event, SearchEvent::SearchComplete(_)))
            .collect();
        assert_eq!(completions, vec![&SearchEvent::SearchComplete(6)]);
        assert!(seen.contains(&SearchEvent::MatchesFound(3)));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn requested_pages_are_searched_newest_first() {
        let (document, entered) = TextDocument::new(&["x"; 7]);
        let (engine, events) = engine_for(&document);
        document.hold(0);

        engine.set_search_string("x");
        engine.search_page(0);
        assert_eq!(entered.recv_timeout(WAIT), Ok(0));
        engine.search_page(5);
        engine.search_page(3);
        document.release(0);

        let seen = collect_until_complete(&events);
        assert_eq!(result_pages(&seen), vec![0, 3, 5, 1, 2, 4, 6]);
        assert_eq!(seen.last(), Some(&SearchEvent::SearchComplete(7)));
    }

    #[test]
    fn new_needle_clears_results() {
        let (document, _) = TextDocument::new(&["foo", "bar"]);
        let (engine, events) = engine_for(&document);
        engine.set_search_string("foo");
        engine.search_page(0);
        collect_until_complete(&events);

        engine.set_search_string("bar");
        assert_eq!(events.recv_timeout(WAIT), Ok(SearchEvent::MatchesFound(0)));
        assert!(engine.results(0).is_empty());
        assert!(!engine.is_searched(0));
        assert_eq!(engine.match_count(), 0);
    }

    #[test]
    fn requests_without_needle_or_out_of_range_are_ignored() {
        let (document, _) = TextDocument::new(&["foo", "bar"]);
        let (engine, events) = engine_for(&document);
        engine.search_page(0);
        engine.set_search_string("foo");
        engine.search_page(7);
        assert_eq!(engine.state(), SearchState::Idle);
        assert_eq!(events.recv_timeout(WAIT), Ok(SearchEvent::MatchesFound(0)));
        assert_eq!(events.recv_timeout(WAIT), Ok(SearchEvent::MatchesFound(0)));
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn jumping_to_another_page_restarts_from_it() {
        let texts = ["x"; 10];
        let (document, entered) = TextDocument::new(&texts);
        let (engine, events) = engine_for(&document);
        document.hold(2);

        engine.set_search_string("x");
        engine.search_page(0);
        while entered.recv_timeout(WAIT).expect("search never reached page 2") != 2 {}

        engine.search_page(7);
        assert_eq!(engine.state(), SearchState::StoppingForRestart);
        document.release(2);

        let seen = collect_until_complete(&events);
        assert_eq!(result_pages(&seen), vec![0, 1, 2, 7, 8, 9, 3, 4, 5, 6]);
        assert_eq!(seen.last(), Some(&SearchEvent::SearchComplete(10)));
    }

    #[test]
    fn stopped_search_resumes_on_next_request() {
        let (document, entered) = TextDocument::new(&["x", "x", "x", "x"]);
        let (engine, events) = engine_for(&document);
        document.hold(1);

        engine.set_search_string("x");
        engine.search_page(0);
        while entered.recv_timeout(WAIT).expect("search never reached page 1") != 1 {}
        engine.stop();
        assert_eq!(engine.state(), SearchState::Stopped);
        document.release(1);

        // the page in progress when stopped is not recorded
        engine.search_page(1);
        let seen = collect_until_complete(&events);
        assert_eq!(seen.last(), Some(&SearchEvent::SearchComplete(4)));
        for page in 0..4 {
            assert_eq!(engine.results(page).len(), 1);
        }
    }

    #[test]
    fn replacing_the_document_resets_the_session() {
        let (document, _) = TextDocument::new(&["foo"]);
        let (engine, events) = engine_for(&document);
        engine.set_search_string("foo");
        engine.search_page(0);
        collect_until_complete(&events);

        engine.set_document(None);
        assert_eq!(events.recv_timeout(WAIT), Ok(SearchEvent::MatchesFound(0)));
        assert!(engine.needle().is_empty());
        assert!(engine.results(0).is_empty());
        engine.search_page(0);
        assert_eq!(engine.state(), SearchState::Idle);
    }
}
