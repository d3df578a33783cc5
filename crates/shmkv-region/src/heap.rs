use std::sync::atomic::AtomicU64;

use crate::backend::{BackendKind, RegionBacking};

/// Region backed by ordinary heap memory.
///
/// Shared between threads of one process only; handy for tests and for
/// embedding the map without any OS mapping.
#[derive(Debug)]
pub struct HeapBacking {
    words: Box<[AtomicU64]>,
}

impl HeapBacking {
    /// Allocate `len_words` zeroed words.
    #[must_use]
    pub fn new(len_words: usize) -> Self {
        let words = (0..len_words).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }
}

impl RegionBacking for HeapBacking {
    fn kind(&self) -> BackendKind {
        BackendKind::Heap
    }

    fn words(&self) -> &[AtomicU64] {
        &self.words
    }
}
