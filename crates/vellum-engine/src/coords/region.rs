/// Integer pixel rectangle inside a texture.
///
/// Used for partial texture uploads and source sub-rectangles of quads.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    #[inline]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Region covering a whole `width` x `height` texture.
    #[inline]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the region lies entirely inside a `width` x `height` texture.
    #[inline]
    pub fn fits_within(self, width: u32, height: u32) -> bool {
        self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }

    /// The part of this region inside a `width` x `height` area. Empty when
    /// the two do not overlap.
    pub fn clamped_to(self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self::new(x, y, self.width.min(width - x), self.height.min(height - y))
    }

    /// Byte length of tightly packed RGBA8 data covering this region.
    #[inline]
    pub fn rgba_len(self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}
