//! Abstract object store trait.
//!
//! Every object store must implement [`ObjectStore`].  The driver only
//! needs to enumerate a bucket and read or replace whole objects, so the
//! trait is limited to exactly that.  Retry and timeout policy belongs to
//! the implementation's client, not to callers.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Async object store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// List every object name in `bucket`.  Order is whatever the store
    /// yields.
    fn list(
        &self,
        bucket: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;

    /// Read the full object `name` from `bucket`.  A missing object fails
    /// with [`crate::errors::ObjectNotFound`].
    fn read(
        &self,
        bucket: &str,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;

    /// Replace the object `name` in `bucket` with `data`.
    fn write(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
