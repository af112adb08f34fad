//! Mapping search hits from page points onto a rendered, possibly rotated page.

use crate::geometry::{PixelSize, RectF, SizeF};
use crate::options::Rotation;

/// Extra room around a hit so the highlight does not hug the glyphs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitPadding {
    pub x: f64,
    pub y: f64,
}

impl HitPadding {
    pub const NONE: HitPadding = HitPadding { x: 0.0, y: 0.0 };
}

impl Default for HitPadding {
    fn default() -> Self {
        Self { x: 2.0, y: 4.0 }
    }
}

/// Maps `hit` (unrotated page points) into pixel coordinates of the page as
/// rendered at `rendered` size with `rotation` applied.
///
/// `page_size` is the intrinsic, unrotated page size. Returns `None` while the
/// page has no usable size.
pub fn hit_to_page_pixels(
    hit: RectF,
    page_size: SizeF,
    rendered: PixelSize,
    rotation: Rotation,
    padding: HitPadding,
) -> Option<RectF> {
    if rendered.is_empty() || page_size.is_empty() {
        return None;
    }

    let oriented = rotation.apply_to_size(page_size);
    let page_w = rendered.width as f64;
    let page_h = rendered.height as f64;
    let zx = page_w / oriented.width;
    let zy = page_h / oriented.height;
    let HitPadding { x: px, y: py } = padding;

    let rect = match rotation {
        Rotation::Rotate0 => RectF::new(
            hit.x * zx - px / 2.0,
            hit.y * zy - py / 2.0,
            hit.width * zx + 2.0 * px,
            hit.height * zy + py,
        ),
        Rotation::Rotate90 => RectF::new(
            page_w - hit.y * zx - hit.height * zx - py / 2.0,
            hit.x * zy - px / 2.0,
            hit.height * zx + 2.0 * py,
            hit.width * zy + px,
        ),
        Rotation::Rotate180 => RectF::new(
            page_w - hit.x * zx - hit.width * zx - px / 2.0,
            page_h - hit.y * zy - hit.height * zy - py / 2.0,
            hit.width * zx + 2.0 * px,
            hit.height * zy + py,
        ),
        Rotation::Rotate270 => RectF::new(
            hit.y * zx - py / 2.0,
            page_h - hit.x * zy - hit.width * zy - px / 2.0,
            hit.height * zx + 2.0 * py,
            hit.width * zy + px,
        ),
    };
    Some(rect)
}
