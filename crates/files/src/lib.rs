//! File access for shares.
//!
//! The engine never touches the filesystem directly; it goes through a
//! [`FileResolver`]. [`FsResolver`] is the stock implementation backed by
//! a local directory.

pub mod error;
pub mod mime;
pub mod resolver;
pub mod sanitize;

pub use error::FileError;
pub use mime::{guess_mime, mime_matches, normalize_mime};
pub use resolver::{FileResolver, FsResolver, InboundFile, ResolveFuture, SendableFile};
pub use sanitize::sanitize_file_name;
