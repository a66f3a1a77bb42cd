//! thanos-relabel library: idempotent label migration for Thanos block
//! metadata.
//!
//! This crate walks every object in a Thanos long-term-storage bucket,
//! finds the block `meta.json` documents and adds a missing external label
//! derived from the bucket name.  Buckets are vetted by a layered guard
//! before anything is read, every document is backed up locally before it
//! is replaced, and a failure on one object never stops the scan.

pub mod backup;
pub mod config;
pub mod controller;
pub mod errors;
pub mod guard;
pub mod migrate;
pub mod patcher;
pub mod storage;
