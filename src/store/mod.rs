pub mod client;
pub mod error;

use std::future::Future;

pub use client::HttpAttachmentStore;
pub use error::FetchError;

/// Object store addressed by opaque URL. The engine only consumes bytes.
pub trait AttachmentStore: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}
