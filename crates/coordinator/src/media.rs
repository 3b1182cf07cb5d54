//! Hook into a media index for received files.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;

/// Future returned by [`MediaIndex::scan`].
pub type MediaFuture<'a> = Pin<Box<dyn Future<Output = io::Result<String>> + Send + 'a>>;

/// Makes successfully received files visible to a media library.
///
/// The coordinator hands over one file at a time. A scan that succeeds
/// returns the URI the index assigned; that URI replaces the share's
/// `uri`. Either way the share is marked scanned and never retried.
pub trait MediaIndex: Send + Sync + 'static {
    fn scan<'a>(&'a self, path: &'a Path, mime_type: Option<&'a str>) -> MediaFuture<'a>;
}
