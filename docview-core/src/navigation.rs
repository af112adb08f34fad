use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    FirstPage,
    LastPage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    CurrentPageChanged(usize),
    PageCountChanged(usize),
    CanGoToPreviousPageChanged(bool),
    CanGoToNextPageChanged(bool),
}

/// Current-page bookkeeping. Events are queued only for actual changes.
pub struct Navigation {
    current_page: usize,
    page_count: usize,
    can_go_previous: bool,
    can_go_next: bool,
    events: Mutex<Vec<NavigationEvent>>,
}

impl Navigation {
    pub fn new() -> Self {
        Self {
            current_page: 0,
            page_count: 0,
            can_go_previous: false,
            can_go_next: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn drain_events(&self) -> Vec<NavigationEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn can_go_to_previous_page(&self) -> bool {
        self.can_go_previous
    }

    pub fn can_go_to_next_page(&self) -> bool {
        self.can_go_next
    }

    /// A new or reloaded document: adopt its page count and return to page 0.
    pub fn reset(&mut self, page_count: usize) {
        if self.page_count != page_count {
            self.page_count = page_count;
            self.events
                .lock()
                .push(NavigationEvent::PageCountChanged(page_count));
        }
        self.move_to(0);
    }

    /// Out-of-range pages are clamped to the last page.
    pub fn set_current_page(&mut self, page: usize) {
        self.move_to(page.min(self.page_count.saturating_sub(1)));
    }

    pub fn go_to(&mut self, page: usize) {
        self.apply(Command::GotoPage { page });
    }

    pub fn next(&mut self) {
        self.apply(Command::NextPage { count: 1 });
    }

    pub fn previous(&mut self) {
        self.apply(Command::PrevPage { count: 1 });
    }

    pub fn apply(&mut self, command: Command) {
        let last = self.page_count.saturating_sub(1);
        let target = match command {
            Command::NextPage { count } => self.current_page.saturating_add(count).min(last),
            Command::PrevPage { count } => self.current_page.saturating_sub(count),
            Command::GotoPage { page } => page.min(last),
            Command::FirstPage => 0,
            Command::LastPage => last,
        };
        self.move_to(target);
    }

    fn move_to(&mut self, page: usize) {
        if page != self.current_page {
            self.current_page = page;
            self.events
                .lock()
                .push(NavigationEvent::CurrentPageChanged(page));
        }
        self.update_prev_next();
    }

    fn update_prev_next(&mut self) {
        let has_previous = self.current_page > 0;
        let has_next = self.current_page + 1 < self.page_count;
        let mut events = self.events.lock();
        if self.can_go_previous != has_previous {
            self.can_go_previous = has_previous;
            events.push(NavigationEvent::CanGoToPreviousPageChanged(has_previous));
        }
        if self.can_go_next != has_next {
            self.can_go_next = has_next;
            events.push(NavigationEvent::CanGoToNextPageChanged(has_next));
        }
    }
}

impl Default for Navigation {
    fn default() -> Self {
        Self::new()
    }
}
