//! File system helpers: walking, copying and checksumming.

pub mod checksum;
pub mod copy;
pub mod walker;
