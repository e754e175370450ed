//! The storage a [`BlobStore`](super::BlobStore) persists into.
//!
//! A [`Directory`] hands out [`StorageFile`]s by relative path. Files are random access byte
//! arrays that grow on write. Two implementations are provided: [`MemDirectory`] keeps
//! everything in memory and is mostly useful for tests, [`FsDirectory`] maps paths to files
//! below a root directory on disk.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, io,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Size information of a [`StorageFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Length of the file in bytes.
    pub size: u64,
}

/// A random access file.
pub trait StorageFile: Send + Sync + fmt::Debug + 'static {
    /// Reads exactly `len` bytes at `offset`.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the file is too short.
    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<io::Result<Bytes>>;

    /// Writes `data` at `offset`, growing the file if needed.
    ///
    /// Growing past the current end fills the gap with zeros.
    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<io::Result<()>>;

    /// Returns the current size of the file.
    fn stat(&self) -> BoxFuture<io::Result<FileStat>>;
}

/// A tree of [`StorageFile`]s addressed by `/` separated relative paths.
pub trait Directory: Send + Sync + fmt::Debug + 'static {
    /// Opens the file at `path`, creating an empty one if it does not exist.
    fn get_or_create_file(&self, path: &str) -> BoxFuture<io::Result<Box<dyn StorageFile>>>;

    /// Opens the file at `path` if it exists. Never creates anything.
    fn open_file(&self, path: &str) -> BoxFuture<io::Result<Option<Box<dyn StorageFile>>>>;

    /// Names of the entries at the top level of the directory.
    fn list(&self) -> BoxFuture<io::Result<Vec<String>>>;
}

/// A [`Directory`] held in memory.
///
/// Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemDirectory {
    files: Arc<Mutex<BTreeMap<String, MemFile>>>,
}

impl MemDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemDirectory {
    fn get_or_create_file(&self, path: &str) -> BoxFuture<io::Result<Box<dyn StorageFile>>> {
        let file = self
            .files
            .lock()
            .expect("poisoned")
            .entry(path.to_string())
            .or_default()
            .clone();
        Box::pin(async move { Ok(Box::new(file) as Box<dyn StorageFile>) })
    }

    fn open_file(&self, path: &str) -> BoxFuture<io::Result<Option<Box<dyn StorageFile>>>> {
        let file = self.files.lock().expect("poisoned").get(path).cloned();
        Box::pin(async move { Ok(file.map(|file| Box::new(file) as Box<dyn StorageFile>)) })
    }

    fn list(&self) -> BoxFuture<io::Result<Vec<String>>> {
        let names: BTreeSet<String> = self
            .files
            .lock()
            .expect("poisoned")
            .keys()
            .map(|path| path.split('/').next().unwrap_or(path).to_string())
            .collect();
        Box::pin(async move { Ok(names.into_iter().collect()) })
    }
}

/// A file of a [`MemDirectory`].
#[derive(Debug, Clone, Default)]
struct MemFile(Arc<Mutex<Vec<u8>>>);

impl StorageFile for MemFile {
    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<io::Result<Bytes>> {
        let res = {
            let data = self.0.lock().expect("poisoned");
            let end = offset.checked_add(len);
            match end {
                Some(end) if end <= data.len() as u64 => Ok(Bytes::copy_from_slice(
                    &data[offset as usize..end as usize],
                )),
                _ => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {len} bytes at {offset} past end {}", data.len()),
                )),
            }
        };
        Box::pin(async move { res })
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<io::Result<()>> {
        {
            let mut file = self.0.lock().expect("poisoned");
            let start = offset as usize;
            let end = start + data.len();
            if file.len() < end {
                file.resize(end, 0);
            }
            file[start..end].copy_from_slice(&data);
        }
        Box::pin(async move { Ok(()) })
    }

    fn stat(&self) -> BoxFuture<io::Result<FileStat>> {
        let size = self.0.lock().expect("poisoned").len() as u64;
        Box::pin(async move { Ok(FileStat { size }) })
    }
}

/// A [`Directory`] rooted at a path on the local file system.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: Arc<PathBuf>,
}

impl FsDirectory {
    /// Uses `root` as the directory. It is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    /// The root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .fold(self.root.as_ref().clone(), |acc, part| acc.join(part))
    }
}

impl Directory for FsDirectory {
    fn get_or_create_file(&self, path: &str) -> BoxFuture<io::Result<Box<dyn StorageFile>>> {
        let path = self.resolve(path);
        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await?;
            Ok(Box::new(FsFile { path }) as Box<dyn StorageFile>)
        })
    }

    fn open_file(&self, path: &str) -> BoxFuture<io::Result<Option<Box<dyn StorageFile>>>> {
        let path = self.resolve(path);
        Box::pin(async move {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {
                    Ok(Some(Box::new(FsFile { path }) as Box<dyn StorageFile>))
                }
                Ok(_) => Ok(None),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn list(&self) -> BoxFuture<io::Result<Vec<String>>> {
        let root = self.root.clone();
        Box::pin(async move {
            let mut out = Vec::new();
            let mut entries = match tokio::fs::read_dir(root.as_ref()).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
            out.sort();
            Ok(out)
        })
    }
}

/// A file of a [`FsDirectory`].
#[derive(Debug)]
struct FsFile {
    path: PathBuf,
}

impl StorageFile for FsFile {
    fn read_at(&self, offset: u64, len: u64) -> BoxFuture<io::Result<Bytes>> {
        let path = self.path.clone();
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<io::Result<()>> {
        let path = self.path.clone();
        Box::pin(async move {
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            Ok(())
        })
    }

    fn stat(&self) -> BoxFuture<io::Result<FileStat>> {
        let path = self.path.clone();
        Box::pin(async move {
            let meta = tokio::fs::metadata(&path).await?;
            Ok(FileStat { size: meta.len() })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn smoke(dir: impl Directory) -> io::Result<()> {
        // opening a missing file leaves no trace
        assert!(dir.open_file("aa/data").await?.is_none());
        assert!(dir.list().await?.is_empty());

        let file = dir.get_or_create_file("aa/data").await?;
        assert_eq!(file.stat().await?.size, 0);
        file.write_at(4, Bytes::from_static(b"world")).await?;
        file.write_at(0, Bytes::from_static(b"hey ")).await?;
        assert_eq!(file.stat().await?.size, 9);
        assert_eq!(file.read_at(0, 9).await?, Bytes::from_static(b"hey world"));
        assert_eq!(file.read_at(4, 3).await?, Bytes::from_static(b"wor"));
        let err = file.read_at(5, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // reopening sees the same content
        let again = dir.get_or_create_file("aa/data").await?;
        assert_eq!(again.read_at(0, 3).await?, Bytes::from_static(b"hey"));
        let opened = dir.open_file("aa/data").await?.expect("existing file");
        assert_eq!(opened.read_at(4, 5).await?, Bytes::from_static(b"world"));

        dir.get_or_create_file("aa/meta").await?;
        dir.get_or_create_file("bb/meta").await?;
        assert_eq!(dir.list().await?, vec!["aa".to_string(), "bb".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn mem_directory() -> io::Result<()> {
        smoke(MemDirectory::new()).await
    }

    #[tokio::test]
    async fn fs_directory() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = FsDirectory::new(tmp.path().join("blobs"));
        smoke(dir).await
    }
}
