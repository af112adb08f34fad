//! Page placement inside the scroll area.
//!
//! Geometry only: nothing here renders. The view feeds page geometries into the
//! renderer as target sizes and into the search overlay as page rectangles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geometry::{PixelSize, Rect, SizeF};
use crate::options::Rotation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageLayout {
    #[default]
    SinglePage,
    FacingPages,
    /// Facing pages with the first page alone, as a cover.
    BookView,
    /// Not laid out; produces an empty layout.
    OverView,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoomMode {
    #[default]
    CustomZoom,
    FitToWidth,
    FitInView,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Margins {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Margins {
    pub const fn uniform(value: i32) -> Self {
        Self {
            left: value,
            top: value,
            right: value,
            bottom: value,
        }
    }

    fn horizontal(&self) -> i32 {
        self.left + self.right
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutSettings {
    pub page_layout: PageLayout,
    pub zoom_mode: ZoomMode,
    pub zoom_factor: f64,
    pub continuous: bool,
    pub page_spacing: i32,
    pub margins: Margins,
    pub screen_resolution: f64,
    pub rotation: Rotation,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            page_layout: PageLayout::SinglePage,
            zoom_mode: ZoomMode::CustomZoom,
            zoom_factor: 1.0,
            continuous: true,
            page_spacing: 3,
            margins: Margins::uniform(6),
            screen_resolution: 1.0,
            rotation: Rotation::Rotate0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentLayout {
    /// Page rectangles in scroll-area coordinates, keyed by page index.
    pub page_geometries: BTreeMap<usize, Rect>,
    pub document_size: PixelSize,
}

impl DocumentLayout {
    pub fn is_empty(&self) -> bool {
        self.page_geometries.is_empty()
    }

    pub fn geometry(&self, page: usize) -> Option<Rect> {
        self.page_geometries.get(&page).copied()
    }

    pub fn y_position_for_page(&self, page: usize) -> i32 {
        self.geometry(page).map_or(0, |rect| rect.y)
    }

    /// Pages intersecting `viewport`, in index order.
    pub fn visible_pages(&self, viewport: &Rect) -> Vec<usize> {
        self.page_geometries
            .iter()
            .filter(|(_, rect)| rect.intersects(viewport))
            .map(|(page, _)| *page)
            .collect()
    }

    /// The page under a 2px probe line at 40% of the viewport height.
    pub fn current_page_at(&self, viewport: &Rect) -> Option<usize> {
        let probe = Rect::new(
            viewport.x,
            viewport.y + (viewport.height as f64 * 0.4) as i32,
            viewport.width,
            2,
        );
        self.page_geometries
            .iter()
            .find(|(_, rect)| rect.intersects(&probe))
            .map(|(page, _)| *page)
    }
}

/// Lays out `page_sizes` (points) for the given settings and viewport.
///
/// In non-continuous mode only the spread containing `current_page` is placed.
pub fn compute(
    settings: &LayoutSettings,
    page_sizes: &[SizeF],
    current_page: usize,
    viewport: &Rect,
) -> DocumentLayout {
    if page_sizes.is_empty() {
        return DocumentLayout::default();
    }
    let current_page = current_page.min(page_sizes.len() - 1);
    let planner = Planner {
        settings,
        page_sizes,
        viewport,
    };
    match settings.page_layout {
        PageLayout::SinglePage => planner.single(current_page),
        PageLayout::FacingPages => planner.spreads(current_page, false),
        PageLayout::BookView => planner.spreads(current_page, true),
        PageLayout::OverView => DocumentLayout::default(),
    }
}

/// Zoom factor actually applied to `page_size` (points) in the given viewport.
pub fn effective_zoom(settings: &LayoutSettings, page_size: SizeF, viewport: &Rect) -> f64 {
    let screen = page_size.scaled_by(settings.screen_resolution);
    if screen.is_empty() {
        return settings.zoom_factor;
    }
    match settings.zoom_mode {
        ZoomMode::CustomZoom => settings.zoom_factor,
        ZoomMode::FitToWidth => {
            (viewport.width - settings.margins.horizontal()) as f64 / screen.width
        }
        ZoomMode::FitInView => {
            let bounds = SizeF::new(
                (viewport.width - settings.margins.horizontal()) as f64,
                (viewport.height - settings.page_spacing) as f64,
            );
            screen.fit_within(bounds).width / screen.width
        }
    }
}

struct Planner<'a> {
    settings: &'a LayoutSettings,
    page_sizes: &'a [SizeF],
    viewport: &'a Rect,
}

impl Planner<'_> {
    fn screen_size(&self, page: usize) -> Option<SizeF> {
        let size = self.page_sizes.get(page)?;
        let size = size.scaled_by(self.settings.screen_resolution);
        Some(self.settings.rotation.apply_to_size(size))
    }

    fn fit_bounds(&self) -> SizeF {
        let s = self.settings;
        let margins = if s.continuous {
            0
        } else {
            s.margins.bottom + s.margins.top - s.page_spacing
        };
        SizeF::new(
            (self.viewport.width - s.margins.horizontal()) as f64,
            (self.viewport.height - s.page_spacing - margins) as f64,
        )
    }

    fn single(&self, current_page: usize) -> DocumentLayout {
        let s = self.settings;
        let (start, end) = if s.continuous {
            (0, self.page_sizes.len() - 1)
        } else {
            (current_page, current_page)
        };

        let mut sizes = Vec::with_capacity(end - start + 1);
        let mut total_width = 0;
        for page in start..=end {
            let Some(mut size) = self.screen_size(page) else {
                continue;
            };
            size = match s.zoom_mode {
                ZoomMode::CustomZoom => size.scaled_by(s.zoom_factor),
                ZoomMode::FitToWidth => {
                    let available = (self.viewport.width - s.margins.horizontal()) as f64;
                    size.scaled_by(ratio(available, size.width))
                }
                ZoomMode::FitInView => {
                    SizeF::new(size.width, size.height + s.page_spacing as f64)
                        .fit_within(self.fit_bounds())
                }
            };
            let pixels = to_rect_size(size);
            total_width = total_width.max(pixels.0 + s.margins.horizontal());
            sizes.push((page, pixels));
        }

        let mut layout = DocumentLayout::default();
        let mut y = s.margins.top;
        for (page, (width, height)) in sizes {
            let x = (total_width.max(self.viewport.width) - width) / 2;
            layout
                .page_geometries
                .insert(page, Rect::new(x, y, width, height));
            y += height + s.page_spacing;
        }
        y += s.margins.bottom - s.page_spacing;
        layout.document_size = PixelSize::new(total_width.max(0) as u32, y.max(0) as u32);
        layout
    }

    /// Two pages per row. With `cover`, page 0 sits alone on the first row.
    fn spreads(&self, current_page: usize, cover: bool) -> DocumentLayout {
        let s = self.settings;
        let last = self.page_sizes.len() - 1;
        let (start, end) = if s.continuous {
            (0, last)
        } else if cover {
            match current_page {
                0 => (0, 0),
                page if page % 2 == 1 => (page, page),
                page => (page - 1, page - 1),
            }
        } else {
            let first = current_page - current_page % 2;
            (first, first)
        };

        let mut rows: Vec<Vec<(usize, (i32, i32))>> = Vec::new();
        let mut total_width = 0;

        let mut first_pair = start;
        if cover && start == 0 {
            if let Some(size) = self.screen_size(0) {
                let size = match s.zoom_mode {
                    ZoomMode::CustomZoom => size.scaled_by(s.zoom_factor),
                    ZoomMode::FitToWidth => {
                        let available = (self.viewport.width - s.margins.horizontal()) as f64;
                        size.scaled_by(ratio(
                            available,
                            2.0 * size.width + s.page_spacing as f64,
                        ))
                    }
                    ZoomMode::FitInView => size.fit_within(self.fit_bounds()),
                };
                let pixels = to_rect_size(size);
                total_width = total_width.max(pixels.0 + s.margins.horizontal());
                rows.push(vec![(0, pixels)]);
            }
            first_pair = 1;
        }

        let mut page = first_pair;
        while page <= end {
            let (Some(left), right) = (self.screen_size(page), self.screen_size(page + 1)) else {
                break;
            };
            let (left, right, row_width) = self.scale_pair(left, right);
            total_width = total_width.max(row_width + s.margins.horizontal());

            let mut row = vec![(page, to_rect_size(left))];
            if let Some(right) = right {
                row.push((page + 1, to_rect_size(right)));
            }
            rows.push(row);
            page += 2;
        }

        let mut layout = DocumentLayout::default();
        let mut y = s.margins.top;
        for row in rows {
            let content: i32 = row.iter().map(|(_, (w, _))| *w).sum::<i32>()
                + s.page_spacing * (row.len() as i32 - 1);
            let height = row.iter().map(|(_, (_, h))| *h).max().unwrap_or(0);
            let mut x = (total_width.max(self.viewport.width) - content) / 2;
            for (page, (width, page_height)) in row {
                layout
                    .page_geometries
                    .insert(page, Rect::new(x, y, width, page_height));
                x += width + s.page_spacing;
            }
            y += height + s.page_spacing;
        }
        y += s.margins.bottom - s.page_spacing;
        layout.document_size = PixelSize::new(total_width.max(0) as u32, y.max(0) as u32);
        layout
    }

    /// Scales one row of a spread; returns both page sizes and the row width.
    fn scale_pair(&self, left: SizeF, right: Option<SizeF>) -> (SizeF, Option<SizeF>, i32) {
        let s = self.settings;
        let spacing = s.page_spacing as f64;
        let right_width = right.map_or(0.0, |r| r.width);
        let right_height = right.map_or(0.0, |r| r.height);
        let combined = SizeF::new(left.width + right_width, left.height.max(right_height));

        match s.zoom_mode {
            ZoomMode::CustomZoom => {
                let z = s.zoom_factor;
                let gap = if right.is_some() { spacing } else { 0.0 };
                (
                    left.scaled_by(z),
                    right.map(|r| r.scaled_by(z)),
                    (combined.width * z + gap).round() as i32,
                )
            }
            ZoomMode::FitToWidth => {
                let available =
                    (self.viewport.width - s.margins.horizontal() - s.page_spacing) as f64;
                let factor = ratio(available, combined.width);
                // A lone trailing page keeps the size it would have in a pair.
                let left_factor = if right.is_some() { factor } else { factor / 2.0 };
                let gap = if right.is_some() { spacing } else { 0.0 };
                (
                    left.scaled_by(left_factor),
                    right.map(|r| r.scaled_by(factor)),
                    (combined.width * factor + gap).round() as i32,
                )
            }
            ZoomMode::FitInView => {
                let fitted = combined.fit_within(self.fit_bounds());
                match right {
                    Some(_) => {
                        let half = SizeF::new(fitted.width / 2.0, fitted.height);
                        (half, Some(half), (fitted.width + spacing).round() as i32)
                    }
                    None => (fitted, None, fitted.width.round() as i32),
                }
            }
        }
    }
}

fn ratio(available: f64, extent: f64) -> f64 {
    if extent > 0.0 {
        (available / extent).max(0.0)
    } else {
        0.0
    }
}

fn to_rect_size(size: SizeF) -> (i32, i32) {
    let pixels = size.to_pixels();
    (pixels.width as i32, pixels.height as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter_pages(count: usize) -> Vec<SizeF> {
        vec![SizeF::new(100.0, 200.0); count]
    }

    fn settings(page_layout: PageLayout) -> LayoutSettings {
        LayoutSettings {
            page_layout,
            ..LayoutSettings::default()
        }
    }

    #[test]
    fn single_page_stacks_pages_vertically() {
        let viewport = Rect::new(0, 0, 200, 300);
        let layout = compute(&settings(PageLayout::SinglePage), &letter_pages(3), 0, &viewport);

        assert_eq!(layout.geometry(0), Some(Rect::new(50, 6, 100, 200)));
        assert_eq!(layout.geometry(1), Some(Rect::new(50, 209, 100, 200)));
        assert_eq!(layout.geometry(2), Some(Rect::new(50, 412, 100, 200)));
        // 6 + 3 * 200 + 2 * 3 + 6
        assert_eq!(layout.document_size, PixelSize::new(112, 618));
    }

    #[test]
    fn non_continuous_single_page_places_current_page_only() {
        let mut s = settings(PageLayout::SinglePage);
        s.continuous = false;
        let layout = compute(&s, &letter_pages(5), 3, &Rect::new(0, 0, 200, 300));
        assert_eq!(layout.page_geometries.keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn rotation_transposes_page_sizes() {
        let mut s = settings(PageLayout::SinglePage);
        s.rotation = Rotation::Rotate90;
        let layout = compute(&s, &letter_pages(1), 0, &Rect::new(0, 0, 400, 400));
        let rect = layout.geometry(0).unwrap();
        assert_eq!((rect.width, rect.height), (200, 100));
    }

    #[test]
    fn fit_to_width_fills_viewport_minus_margins() {
        let mut s = settings(PageLayout::SinglePage);
        s.zoom_mode = ZoomMode::FitToWidth;
        let layout = compute(&s, &letter_pages(2), 0, &Rect::new(0, 0, 212, 300));
        let rect = layout.geometry(0).unwrap();
        assert_eq!((rect.width, rect.height), (200, 400));
        assert_eq!(rect.x, 6);
    }

    #[test]
    fn facing_pages_pair_even_and_odd_pages() {
        let layout = compute(
            &settings(PageLayout::FacingPages),
            &letter_pages(3),
            0,
            &Rect::new(0, 0, 300, 300),
        );
        let p0 = layout.geometry(0).unwrap();
        let p1 = layout.geometry(1).unwrap();
        let p2 = layout.geometry(2).unwrap();
        assert_eq!(p0.y, p1.y);
        assert_eq!(p1.x, p0.right() + 3);
        assert!(p2.y > p0.bottom());
    }

    #[test]
    fn book_view_puts_cover_alone() {
        let layout = compute(
            &settings(PageLayout::BookView),
            &letter_pages(4),
            0,
            &Rect::new(0, 0, 300, 300),
        );
        let cover = layout.geometry(0).unwrap();
        let p1 = layout.geometry(1).unwrap();
        let p2 = layout.geometry(2).unwrap();
        let p3 = layout.geometry(3).unwrap();
        assert!(p1.y > cover.bottom());
        assert_eq!(p1.y, p2.y);
        assert!(p3.y > p2.bottom());
    }

    #[test]
    fn non_continuous_book_view_shows_spread_of_current_page() {
        let mut s = settings(PageLayout::BookView);
        s.continuous = false;
        let layout = compute(&s, &letter_pages(6), 4, &Rect::new(0, 0, 300, 300));
        assert_eq!(layout.page_geometries.keys().copied().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn probe_line_selects_current_page() {
        let layout = compute(
            &settings(PageLayout::SinglePage),
            &letter_pages(3),
            0,
            &Rect::new(0, 0, 200, 300),
        );
        assert_eq!(layout.current_page_at(&Rect::new(0, 0, 200, 300)), Some(0));
        assert_eq!(layout.current_page_at(&Rect::new(0, 150, 200, 300)), Some(1));
        assert_eq!(
            layout.visible_pages(&Rect::new(0, 150, 200, 300)),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn overview_is_not_laid_out() {
        let layout = compute(
            &settings(PageLayout::OverView),
            &letter_pages(3),
            0,
            &Rect::new(0, 0, 200, 300),
        );
        assert!(layout.is_empty());
    }
}
