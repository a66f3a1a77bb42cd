//! Object store collaborators.
//!
//! The [`backend::ObjectStore`] trait abstracts over the bucket being
//! migrated.  Implementations include Google Cloud Storage, a local
//! directory tree standing in for a bucket, and an in-memory store.

pub mod backend;
pub mod gcs;
pub mod local;
pub mod memory;
