use std::collections::BTreeMap;

use docview_core::RectF;

/// Hits on one page, split into the focused hit and the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHighlights {
    pub current: Option<RectF>,
    pub others: Vec<RectF>,
}

impl SearchHighlights {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.others.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HitRef {
    page: usize,
    index: usize,
}

/// Walks the hits of a search in document order.
///
/// Fed from [`crate::SearchEvent::ResultsReady`]; pages can arrive in any
/// order and the focused hit stays put while more pages come in.
#[derive(Debug, Clone, Default)]
pub struct SearchCursor {
    hits: BTreeMap<usize, Vec<RectF>>,
    current: Option<HitRef>,
}

impl SearchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.hits.clear();
        self.current = None;
    }

    pub fn add_page(&mut self, page: usize, rects: Vec<RectF>) {
        if rects.is_empty() {
            self.hits.remove(&page);
        } else {
            self.hits.insert(page, rects);
        }
        if let Some(current) = self.current {
            if !self.is_valid(current) {
                self.current = None;
            }
        }
    }

    pub fn total(&self) -> usize {
        self.hits.values().map(Vec::len).sum()
    }

    pub fn current_page(&self) -> Option<usize> {
        self.current.map(|hit| hit.page)
    }

    pub fn current_rect(&self) -> Option<RectF> {
        self.current
            .and_then(|hit| self.hits.get(&hit.page)?.get(hit.index).copied())
    }

    /// Focuses the first hit on `page` or after it, wrapping to the start.
    pub fn highlight_first_from(&mut self, page: usize) -> Option<usize> {
        let found = self
            .hits
            .range(page..)
            .next()
            .or_else(|| self.hits.iter().next())
            .map(|(&page, _)| HitRef { page, index: 0 });
        self.current = found;
        self.current_page()
    }

    /// Moves to the following hit, wrapping after the last one. Returns its page.
    pub fn next(&mut self) -> Option<usize> {
        let Some(current) = self.current else {
            return self.highlight_first_from(0);
        };
        let on_page = self.hits.get(&current.page).map_or(0, Vec::len);
        self.current = if current.index + 1 < on_page {
            Some(HitRef {
                index: current.index + 1,
                ..current
            })
        } else {
            self.hits
                .range(current.page + 1..)
                .next()
                .or_else(|| self.hits.iter().next())
                .map(|(&page, _)| HitRef { page, index: 0 })
        };
        self.current_page()
    }

    /// Moves to the preceding hit, wrapping before the first one. Returns its page.
    pub fn previous(&mut self) -> Option<usize> {
        let Some(current) = self.current else {
            self.current = self.last_hit();
            return self.current_page();
        };
        self.current = if current.index > 0 {
            Some(HitRef {
                index: current.index - 1,
                ..current
            })
        } else {
            self.hits
                .range(..current.page)
                .next_back()
                .map(|(&page, rects)| HitRef {
                    page,
                    index: rects.len() - 1,
                })
                .or_else(|| self.last_hit())
        };
        self.current_page()
    }

    /// One-based ordinal of the focused hit and the total hit count.
    pub fn position(&self) -> Option<(usize, usize)> {
        let current = self.current?;
        let before: usize = self
            .hits
            .range(..current.page)
            .map(|(_, rects)| rects.len())
            .sum();
        Some((before + current.index + 1, self.total()))
    }

    pub fn highlights(&self, page: usize) -> SearchHighlights {
        let Some(rects) = self.hits.get(&page) else {
            return SearchHighlights::default();
        };
        let focused = self
            .current
            .filter(|hit| hit.page == page)
            .map(|hit| hit.index);
        let mut highlights = SearchHighlights::default();
        for (index, rect) in rects.iter().enumerate() {
            if Some(index) == focused {
                highlights.current = Some(*rect);
            } else {
                highlights.others.push(*rect);
            }
        }
        highlights
    }

    fn last_hit(&self) -> Option<HitRef> {
        self.hits.iter().next_back().map(|(&page, rects)| HitRef {
            page,
            index: rects.len() - 1,
        })
    }

    fn is_valid(&self, hit: HitRef) -> bool {
        self.hits
            .get(&hit.page)
            .is_some_and(|rects| hit.index < rects.len())
    }
}
