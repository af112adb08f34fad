use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::geometry::{PixelSize, SizeF};

/// Clockwise page rotation applied at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Rotate0 => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }

    /// Accepts any multiple of 90, negative values included.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Rotate0),
            90 => Some(Rotation::Rotate90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Rotate270),
            _ => None,
        }
    }

    /// Quarter turns swap the width and height of the page.
    pub fn is_transposed(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }

    pub fn apply_to_size(self, size: SizeF) -> SizeF {
        if self.is_transposed() {
            size.transposed()
        } else {
            size
        }
    }

    pub fn apply_to_pixels(self, size: PixelSize) -> PixelSize {
        if self.is_transposed() {
            size.transposed()
        } else {
            size
        }
    }
}

bitflags! {
    /// Codec hints; adapters ignore the ones their format cannot honour.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RenderFlags: u8 {
        const ANNOTATIONS = 0x01;
        const OPTIMIZED_FOR_LCD = 0x02;
        const GRAYSCALE = 0x04;
        const FORCE_HALFTONE = 0x08;
        const TEXT_ALIASED = 0x10;
        const IMAGE_ALIASED = 0x20;
        const PATH_ALIASED = 0x40;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderOptions {
    pub rotation: Rotation,
    pub flags: RenderFlags,
}

impl RenderOptions {
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_flags(mut self, flags: RenderFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_from_degrees_normalises() {
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Rotate270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Rotate90));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn quarter_turns_transpose_sizes() {
        let size = PixelSize::new(300, 400);
        assert_eq!(Rotation::Rotate90.apply_to_pixels(size), PixelSize::new(400, 300));
        assert_eq!(Rotation::Rotate180.apply_to_pixels(size), size);
    }
}
