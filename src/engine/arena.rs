use super::types::EngineError;

/// Tensor offsets are rounded up to this many bytes
pub const ARENA_ALIGNMENT: usize = 16;

/// Default working arena size in bytes
pub const TENSOR_ARENA_SIZE: usize = 2 * 1024;

pub fn align_up(n: usize) -> usize {
    n.div_ceil(ARENA_ALIGNMENT) * ARENA_ALIGNMENT
}

/// Bytes needed to place tensors of the given lengths back to back
pub fn required_bytes(lengths: &[usize]) -> usize {
    lengths.iter().map(|&len| align_up(len)).sum()
}

/// Fixed-size working memory owned by one interpreter.
///
/// Regions are handed out by a bump pointer and never released; the
/// backing storage is never resized.
#[derive(Debug)]
pub struct Arena {
    data: Box<[i8]>,
    used: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Reserves `len` bytes and returns their offset
    pub fn reserve(&mut self, len: usize) -> Result<usize, EngineError> {
        let offset = self.used;
        let end = offset + align_up(len);
        if end > self.capacity() {
            return Err(EngineError::ArenaExhausted {
                required: end,
                capacity: self.capacity(),
            });
        }
        self.used = end;
        Ok(offset)
    }

    pub fn region(&self, offset: usize, len: usize) -> &[i8] {
        &self.data[offset..offset + len]
    }

    pub fn region_mut(&mut self, offset: usize, len: usize) -> &mut [i8] {
        &mut self.data[offset..offset + len]
    }

    /// A read-only source region and a writable destination region placed
    /// after it. `None` if they overlap or are out of order.
    pub fn split_regions(
        &mut self,
        src: (usize, usize),
        dst: (usize, usize),
    ) -> Option<(&[i8], &mut [i8])> {
        let (src_offset, src_len) = src;
        let (dst_offset, dst_len) = dst;
        if src_offset + src_len > dst_offset || dst_offset + dst_len > self.data.len() {
            return None;
        }
        let (head, tail) = self.data.split_at_mut(dst_offset);
        Some((&head[src_offset..src_offset + src_len], &mut tail[..dst_len]))
    }
}
