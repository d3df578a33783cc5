//! Shared memory regions for the shmkv map.
//!
//! A region is a flat, zero-initialized array of 64-bit atomic words. Every
//! structure the map keeps (header, contexts, hash cells, segments) lives
//! inside one region, addressed by word index, so the same bytes can be
//! mapped by many processes at different virtual addresses.
#![allow(unsafe_code)]

pub mod backend;
pub mod heap;
pub mod mmap;
pub mod region;

pub use backend::{BackendKind, RegionBacking, StorageBackend};
pub use heap::HeapBacking;
pub use mmap::MmapBacking;
pub use region::ShmRegion;
