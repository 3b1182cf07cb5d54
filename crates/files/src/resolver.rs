//! File resolution for outbound shares and destination allocation for
//! inbound ones.

use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use sysinfo::Disks;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::error::FileError;
use crate::mime::{guess_mime, normalize_mime};
use crate::sanitize::sanitize_file_name;

/// MIME type used when nothing better is known.
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Attempts at finding a free name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Space left free on the inbound filesystem after an object is stored.
pub const DEFAULT_FREE_SPACE_RESERVE: u64 = 1024 * 1024;

/// Reports the bytes available on the filesystem holding a path, or `None`
/// when that cannot be determined.
pub type AvailableSpace = fn(&Path) -> Option<u64>;

/// Future returned by [`FileResolver`] methods.
pub type ResolveFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FileError>> + Send + 'a>>;

/// An outbound file ready to stream.
pub struct SendableFile {
    pub name: String,
    pub mime_type: String,
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for SendableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendableFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A freshly created destination for an inbound object.
#[derive(Debug)]
pub struct InboundFile {
    pub path: PathBuf,
    pub file: File,
}

/// Source of outbound bytes and sink for inbound ones.
pub trait FileResolver: Send + Sync + 'static {
    /// Opens the file behind `uri`. A zero-length file is an error.
    fn resolve_outbound<'a>(
        &'a self,
        uri: &'a str,
        declared_mime: Option<&'a str>,
    ) -> ResolveFuture<'a, SendableFile>;

    /// Creates a new, empty destination file for an object of `length`
    /// bytes. Never overwrites an existing file.
    fn allocate_inbound<'a>(&'a self, hint: &'a str, length: u64) -> ResolveFuture<'a, InboundFile>;
}

/// [`FileResolver`] backed by the local filesystem.
///
/// Outbound URIs are `file://` URIs or plain absolute paths. Inbound files
/// land in `inbound_dir`; name collisions get a `-N` suffix before the
/// extension.
///
/// An inbound object is refused with `StorageFull` when it would leave
/// less than the free-space reserve on the inbound filesystem.
#[derive(Debug, Clone)]
pub struct FsResolver {
    inbound_dir: PathBuf,
    max_inbound_bytes: Option<u64>,
    free_space_reserve: u64,
    available_space: AvailableSpace,
}

impl FsResolver {
    pub fn new(inbound_dir: impl Into<PathBuf>) -> Self {
        Self {
            inbound_dir: inbound_dir.into(),
            max_inbound_bytes: None,
            free_space_reserve: DEFAULT_FREE_SPACE_RESERVE,
            available_space: disk_available_space,
        }
    }

    /// Refuses inbound objects larger than `limit` with `StorageFull`.
    pub fn with_max_inbound_bytes(mut self, limit: u64) -> Self {
        self.max_inbound_bytes = Some(limit);
        self
    }

    pub fn with_free_space_reserve(mut self, reserve: u64) -> Self {
        self.free_space_reserve = reserve;
        self
    }

    /// Replaces the free-space lookup, which defaults to the mounted disks.
    pub fn with_available_space(mut self, available_space: AvailableSpace) -> Self {
        self.available_space = available_space;
        self
    }

    pub fn inbound_dir(&self) -> &Path {
        &self.inbound_dir
    }

    async fn open_outbound(
        &self,
        uri: &str,
        declared_mime: Option<&str>,
    ) -> Result<SendableFile, FileError> {
        let path = path_from_uri(uri)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FileError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(FileError::NotFound(path.display().to_string()));
        }
        let length = meta.len();
        if length == 0 {
            return Err(FileError::Empty(path.display().to_string()));
        }
        if length > u64::from(u32::MAX) {
            return Err(FileError::TooLarge(length));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| FileError::InvalidName(path.display().to_string()))?;
        let mime_type = declared_mime
            .and_then(normalize_mime)
            .filter(|m| m != "*/*")
            .or_else(|| guess_mime(&name))
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        let file = File::open(&path).await?;
        debug!(path = %path.display(), length, %mime_type, "resolved outbound file");
        Ok(SendableFile {
            name,
            mime_type,
            length,
            reader: Box::new(file),
        })
    }

    async fn create_inbound(&self, hint: &str, length: u64) -> Result<InboundFile, FileError> {
        let name = sanitize_file_name(hint)?;
        if let Some(limit) = self.max_inbound_bytes {
            if length > limit {
                return Err(FileError::StorageFull { needed: length });
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.inbound_dir).await {
            warn!(dir = %self.inbound_dir.display(), error = %e, "inbound directory unavailable");
            return Err(FileError::NoStorage(e.to_string()));
        }

        self.check_free_space(length).await?;

        let (stem, ext) = split_name(&name);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                name.clone()
            } else {
                format!("{stem}-{attempt}{ext}")
            };
            let path = self.inbound_dir.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(path = %path.display(), length, "allocated inbound file");
                    return Ok(InboundFile { path, file });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FileError::InvalidName(format!(
            "no free name for {name} after {MAX_NAME_ATTEMPTS} attempts"
        )))
    }
}

impl FileResolver for FsResolver {
    fn resolve_outbound<'a>(
        &'a self,
        uri: &'a str,
        declared_mime: Option<&'a str>,
    ) -> ResolveFuture<'a, SendableFile> {
        Box::pin(self.open_outbound(uri, declared_mime))
    }

    fn allocate_inbound<'a>(&'a self, hint: &'a str, length: u64) -> ResolveFuture<'a, InboundFile> {
        Box::pin(self.create_inbound(hint, length))
    }
}

impl FsResolver {
    async fn check_free_space(&self, length: u64) -> Result<(), FileError> {
        let dir = self.inbound_dir.clone();
        let lookup = self.available_space;
        let available = tokio::task::spawn_blocking(move || lookup(&dir))
            .await
            .map_err(|e| FileError::NoStorage(e.to_string()))?;
        let Some(available) = available else {
            debug!(dir = %self.inbound_dir.display(), "free space unknown, not checked");
            return Ok(());
        };
        let needed = length.saturating_add(self.free_space_reserve);
        if available < needed {
            warn!(
                dir = %self.inbound_dir.display(),
                available,
                needed,
                "not enough free space for inbound object"
            );
            return Err(FileError::StorageFull { needed });
        }
        Ok(())
    }
}

/// Available bytes on the disk whose mount point is the longest prefix of
/// `path`.
fn disk_available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn path_from_uri(uri: &str) -> Result<PathBuf, FileError> {
    if let Some(rest) = uri.strip_prefix("file://") {
        // Only local files: "file:///path" or "file://localhost/path".
        let rest = rest.strip_prefix("localhost").unwrap_or(rest);
        if rest.starts_with('/') {
            return Ok(PathBuf::from(rest));
        }
        return Err(FileError::UnsupportedUri(uri.to_string()));
    }
    if uri.contains("://") {
        return Err(FileError::UnsupportedUri(uri.to_string()));
    }
    let path = PathBuf::from(uri);
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(FileError::UnsupportedUri(uri.to_string()))
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn resolves_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, vec![9u8; 1000]).unwrap();

        let resolver = FsResolver::new(dir.path().join("in"));
        let uri = format!("file://{}", path.display());
        let mut file = resolver.resolve_outbound(&uri, None).await.unwrap();
        assert_eq!(file.name, "a.jpg");
        assert_eq!(file.mime_type, "image/jpeg");
        assert_eq!(file.length, 1000);

        let mut data = Vec::new();
        file.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len(), 1000);
    }

    #[tokio::test]
    async fn declared_mime_wins_over_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card");
        std::fs::write(&path, b"BEGIN:VCARD").unwrap();

        let resolver = FsResolver::new(dir.path());
        let file = resolver
            .resolve_outbound(path.to_str().unwrap(), Some("Text/X-VCard"))
            .await
            .unwrap();
        assert_eq!(file.mime_type, "text/x-vcard");

        let unknown = resolver
            .resolve_outbound(path.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(unknown.mime_type, FALLBACK_MIME);
    }

    #[tokio::test]
    async fn zero_length_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let resolver = FsResolver::new(dir.path());
        let err = resolver
            .resolve_outbound(path.to_str().unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Empty(_)));
        assert_eq!(err.status(), opush_share::ShareStatus::FileError);
    }

    #[tokio::test]
    async fn missing_file_and_foreign_scheme() {
        let resolver = FsResolver::new("/nonexistent");
        assert!(matches!(
            resolver.resolve_outbound("file:///no/such/file", None).await,
            Err(FileError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve_outbound("content://media/1", None).await,
            Err(FileError::UnsupportedUri(_))
        ));
        assert!(matches!(
            resolver.resolve_outbound("relative/path", None).await,
            Err(FileError::UnsupportedUri(_))
        ));
    }

    #[tokio::test]
    async fn inbound_names_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path());

        let first = resolver.allocate_inbound("x.png", 500).await.unwrap();
        let second = resolver.allocate_inbound("x.png", 500).await.unwrap();
        let third = resolver.allocate_inbound("../x.png", 500).await.unwrap();

        assert_eq!(first.path, dir.path().join("x.png"));
        assert_eq!(second.path, dir.path().join("x-1.png"));
        assert_eq!(third.path, dir.path().join("x-2.png"));
    }

    #[tokio::test]
    async fn inbound_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path()).with_max_inbound_bytes(100);
        let err = resolver.allocate_inbound("big.bin", 101).await.unwrap_err();
        assert_eq!(err.status(), opush_share::ShareStatus::StorageFull);
        assert!(resolver.allocate_inbound("ok.bin", 100).await.is_ok());
    }

    #[tokio::test]
    async fn inbound_object_must_fit_in_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path())
            .with_available_space(|_| Some(1024 * 1024))
            .with_free_space_reserve(1024);

        let err = resolver
            .allocate_inbound("huge.bin", 100 * 1024 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::StorageFull { .. }));
        assert_eq!(err.status(), opush_share::ShareStatus::StorageFull);
        assert!(!dir.path().join("huge.bin").exists());

        let err = resolver
            .allocate_inbound("edge.bin", 1024 * 1024 - 1023)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::StorageFull { .. }));
        assert!(resolver.allocate_inbound("fits.bin", 1024 * 1024 - 1024).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_free_space_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path()).with_available_space(|_| None);
        assert!(resolver.allocate_inbound("a.bin", u64::MAX / 2).await.is_ok());
    }

    #[tokio::test]
    async fn mounted_disk_refuses_impossible_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new(dir.path());
        if disk_available_space(dir.path()).is_none() {
            // No disk in the mount table covers the temp dir.
            return;
        }
        let err = resolver
            .allocate_inbound("huge.bin", u64::MAX / 2)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::StorageFull { .. }));
    }

    #[tokio::test]
    async fn inbound_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let resolver = FsResolver::new(&nested);
        let file = resolver.allocate_inbound("note.txt", 4).await.unwrap();
        assert!(file.path.starts_with(&nested));
        assert!(file.path.exists());
    }

    #[test]
    fn split_name_handles_dotfiles() {
        assert_eq!(split_name("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_name("README"), ("README", ""));
        assert_eq!(split_name(".env"), (".env", ""));
    }
}
