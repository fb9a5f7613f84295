use bytemuck::{Pod, Zeroable};

use crate::backend::{GeometryKind, GeometryLayout};

/// Fixed-capacity CPU staging area for one batch.
///
/// `used` only grows between flushes and never exceeds capacity; callers
/// check [`fits`](Self::fits) and flush before appending.
#[derive(Debug)]
pub(crate) struct BatchBuffer<V> {
    vertices: Vec<V>,
    indices: Vec<u16>,
    max_vertices: usize,
    max_indices: usize,
}

impl<V: Pod + Zeroable> BatchBuffer<V> {
    pub fn new(max_vertices: usize, max_indices: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(max_vertices),
            indices: Vec::with_capacity(max_indices),
            max_vertices,
            max_indices,
        }
    }

    #[inline]
    pub fn used_vertices(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn used_indices(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    #[inline]
    pub fn max_vertices(&self) -> usize {
        self.max_vertices
    }

    #[inline]
    pub fn max_indices(&self) -> usize {
        self.max_indices
    }

    /// Whether `vertices` more vertices and `indices` more indices fit.
    #[inline]
    pub fn fits(&self, vertices: usize, indices: usize) -> bool {
        self.vertices.len() + vertices <= self.max_vertices
            && self.indices.len() + indices <= self.max_indices
    }

    pub fn push_vertices(&mut self, vertices: &[V]) {
        debug_assert!(self.fits(vertices.len(), 0));
        self.vertices.extend_from_slice(vertices);
    }

    /// Appends indices relative to the first vertex of the next primitive.
    pub fn push_indices(&mut self, base: u16, indices: &[u16]) {
        debug_assert!(self.fits(0, indices.len()));
        self.indices.extend(indices.iter().map(|i| base + i));
    }

    /// Appends zeroed space and returns it with the index of its first vertex.
    pub fn reserve(&mut self, vertices: usize, indices: usize) -> (&mut [V], &mut [u16], u16) {
        debug_assert!(self.fits(vertices, indices));
        let v0 = self.vertices.len();
        let i0 = self.indices.len();
        self.vertices.resize(v0 + vertices, V::zeroed());
        self.indices.resize(i0 + indices, 0);
        (&mut self.vertices[v0..], &mut self.indices[i0..], v0 as u16)
    }

    /// Byte view of the used vertex range.
    #[inline]
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Byte view of the used index range.
    #[inline]
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn reset(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    pub fn layout(&self, kind: GeometryKind) -> GeometryLayout {
        GeometryLayout {
            kind,
            vertex_stride: std::mem::size_of::<V>(),
            max_vertices: self.max_vertices,
            max_indices: self.max_indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_tracks_both_streams() {
        let mut b = BatchBuffer::<u32>::new(4, 6);
        assert!(b.fits(4, 6));
        b.push_vertices(&[1, 2, 3]);
        assert!(b.fits(1, 6));
        assert!(!b.fits(2, 0));
        b.push_indices(0, &[0, 1, 2, 0, 2]);
        assert!(!b.fits(0, 2));
    }

    #[test]
    fn indices_are_offset_by_base() {
        let mut b = BatchBuffer::<u32>::new(8, 12);
        b.push_indices(4, &[0, 2, 1]);
        assert_eq!(bytemuck::cast_slice::<u8, u16>(b.index_bytes()), &[4, 6, 5]);
    }

    #[test]
    fn reserve_returns_zeroed_tail_and_base() {
        let mut b = BatchBuffer::<u32>::new(8, 12);
        b.push_vertices(&[9, 9]);
        let (v, i, base) = b.reserve(3, 4);
        assert_eq!(base, 2);
        assert_eq!(v, &[0, 0, 0]);
        assert_eq!(i.len(), 4);
        v[0] = 5;
        assert_eq!(b.used_vertices(), 5);
        assert_eq!(b.used_indices(), 4);
    }

    #[test]
    fn byte_views_cover_used_prefix_only() {
        let mut b = BatchBuffer::<u32>::new(16, 0);
        b.push_vertices(&[1, 2]);
        assert_eq!(b.vertex_bytes().len(), 8);
        b.reset();
        assert!(b.is_empty());
        assert!(b.vertex_bytes().is_empty());
    }
}
