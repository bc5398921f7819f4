//! Vertex-element layout translation and its per-context cache.
//!
//! Translating a vertex-element list into `VAP_PROG_STREAM_CNTL` words is done once per distinct
//! layout; rebinding a layout that was seen before reuses the cached result.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::state::{VertexElement, VertexFormat, VertexStreamState};

const STREAM_LAST: u32 = 1 << 13;
const STREAM_DST_SHIFT: u32 = 8;
const SWIZZLE_ZERO: u32 = 4;
const SWIZZLE_ONE: u32 = 5;
const SWIZZLE_WRITE_ALL: u32 = 0xF << 12;

fn components(format: VertexFormat) -> u32 {
    match format {
        VertexFormat::Float1 => 1,
        VertexFormat::Float2 => 2,
        VertexFormat::Float3 => 3,
        VertexFormat::Float4 | VertexFormat::UByte4Norm => 4,
    }
}

/// Missing components read as `(0, 0, 0, 1)`.
fn swizzle(format: VertexFormat) -> u32 {
    let n = components(format);
    let select = (0..4u32).fold(0, |acc, c| {
        let sel = if c < n {
            c
        } else if c == 3 {
            SWIZZLE_ONE
        } else {
            SWIZZLE_ZERO
        };
        acc | (sel << (3 * c))
    });
    select | SWIZZLE_WRITE_ALL
}

fn pack_pairs(halves: impl Iterator<Item = u32>) -> Vec<u32> {
    let halves: Vec<u32> = halves.collect();
    halves
        .chunks(2)
        .map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0) << 16))
        .collect()
}

pub fn translate_elements(elements: &[VertexElement]) -> VertexStreamState {
    let last = elements.len().saturating_sub(1);
    let cntl = elements.iter().enumerate().map(|(i, el)| {
        let mut word = (el.format.hw() & 0xF) | ((i as u32) << STREAM_DST_SHIFT);
        if i == last {
            word |= STREAM_LAST;
        }
        word
    });
    let ext = elements.iter().map(|el| swizzle(el.format));
    let vtx_size = elements
        .iter()
        .map(|el| el.format.size_bytes().div_ceil(4))
        .sum();
    VertexStreamState {
        prog_stream_cntl: pack_pairs(cntl),
        prog_stream_cntl_ext: pack_pairs(ext),
        vtx_size,
    }
}

#[derive(Debug, Default)]
pub struct TranslateCache {
    entries: HashMap<Vec<VertexElement>, Arc<VertexStreamState>>,
    hits: u64,
    misses: u64,
}

impl TranslateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, elements: &[VertexElement]) -> Arc<VertexStreamState> {
        if let Some(hit) = self.entries.get(elements) {
            self.hits += 1;
            return Arc::clone(hit);
        }
        self.misses += 1;
        let translated = Arc::new(translate_elements(elements));
        trace!(elements = elements.len(), "vertex layout translated");
        self.entries
            .insert(elements.to_vec(), Arc::clone(&translated));
        translated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(i: u32, format: VertexFormat) -> VertexElement {
        VertexElement {
            buffer_index: 0,
            offset: 16 * i,
            format,
        }
    }

    #[test]
    fn three_elements_pack_into_two_words() {
        let state = translate_elements(&[
            element(0, VertexFormat::Float4),
            element(1, VertexFormat::Float2),
            element(2, VertexFormat::UByte4Norm),
        ]);
        assert_eq!(state.prog_stream_cntl.len(), 2);
        assert_eq!(state.prog_stream_cntl_ext.len(), 2);
        assert_eq!(state.vtx_size, 4 + 2 + 1);
        // Only the final element carries the terminator.
        assert_eq!(state.prog_stream_cntl[0] & STREAM_LAST, 0);
        assert_ne!(state.prog_stream_cntl[1] & STREAM_LAST, 0);
    }

    #[test]
    fn short_formats_fill_with_zero_and_one() {
        let sw = swizzle(VertexFormat::Float2);
        assert_eq!(sw & 0x7, 0);
        assert_eq!((sw >> 3) & 0x7, 1);
        assert_eq!((sw >> 6) & 0x7, SWIZZLE_ZERO);
        assert_eq!((sw >> 9) & 0x7, SWIZZLE_ONE);
    }

    #[test]
    fn repeated_layouts_hit_the_cache() {
        let mut cache = TranslateCache::new();
        let layout = [element(0, VertexFormat::Float3)];
        let a = cache.get(&layout);
        let b = cache.get(&layout);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((cache.hits(), cache.misses(), cache.len()), (1, 1, 1));
    }
}
