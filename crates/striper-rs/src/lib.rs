//! Core striper (RAID-0 / RAID-10) data-path primitives: geometry, the
//! sub-I/O state machines and the simulated transport used to drive them.
#![allow(clippy::cargo_common_metadata)]

pub mod config;
pub mod engine;
pub mod geometry;
pub mod resource;
pub mod transact;
pub mod transport;

/// Bytes of host data carried by one block.
pub const BLOCK_DATA_BYTES: usize = 512;
/// Bytes of checksum/stamp metadata trailing the data in one block.
pub const BLOCK_META_BYTES: usize = 8;
/// On-media size of one block: data plus trailing metadata.
pub const BLOCK_BYTES: usize = BLOCK_DATA_BYTES + BLOCK_META_BYTES;
