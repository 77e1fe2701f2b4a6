use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;

use super::helpers::{DEFAULT_CONTENT_TYPE, detect_content_type};

/// Chunk size used when streaming a file body (64KB)
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Where the bytes of a local file come from
#[derive(Debug, Clone)]
pub enum FileBody {
    /// A file on disk, read lazily
    Path(PathBuf),
    /// Bytes already held in memory
    Memory(Bytes),
}

/// A local file waiting to be uploaded
///
/// The name and content type are what the grant endpoint sees; the size is
/// captured once when the file is enqueued and drives progress reporting.
#[derive(Debug, Clone)]
pub struct LocalFile {
    name: String,
    content_type: Option<String>,
    size: u64,
    body: FileBody,
}

impl LocalFile {
    /// Describe a file on disk, detecting its content type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Not a regular file: {}", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Path has no file name: {}", path.display()),
                )
            })?;

        Ok(Self {
            name,
            content_type: Some(detect_content_type(path)),
            size: metadata.len(),
            body: FileBody::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(
        name: impl Into<String>,
        content_type: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            content_type,
            size: data.len() as u64,
            body: FileBody::Memory(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content type as detected, or `application/octet-stream`
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn body(&self) -> &FileBody {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Open the file as an incremental byte stream
    pub async fn open_stream(
        &self,
        chunk_size: usize,
    ) -> io::Result<BoxStream<'static, io::Result<Bytes>>> {
        let chunk_size = chunk_size.max(1);
        match &self.body {
            FileBody::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(ReaderStream::with_capacity(file, chunk_size).boxed())
            }
            FileBody::Memory(data) => {
                let data = data.clone();
                let chunks = (0..data.len())
                    .step_by(chunk_size)
                    .map(move |start| {
                        let end = (start + chunk_size).min(data.len());
                        Ok(data.slice(start..end))
                    })
                    .collect::<Vec<_>>();
                Ok(stream::iter(chunks).boxed())
            }
        }
    }

    /// Read the whole body into memory
    pub async fn read_all(&self) -> io::Result<Bytes> {
        match &self.body {
            FileBody::Path(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            FileBody::Memory(data) => Ok(data.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Write;

    #[tokio::test]
    async fn test_from_path_detects_type_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 300])
            .unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        assert_eq!(file.name(), "photo.png");
        assert_eq!(file.content_type(), "image/png");
        assert_eq!(file.size(), 300);
    }

    #[tokio::test]
    async fn test_from_path_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFile::from_path(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_stream_is_chunked() {
        let file = LocalFile::from_bytes("a.bin", None, vec![7u8; 10]);
        let chunks: Vec<Bytes> = file.open_stream(4).await.unwrap().try_collect().await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(file.content_type(), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_path_stream_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"hello world").unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        let chunks: Vec<Bytes> = file.open_stream(3).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
        assert_eq!(file.read_all().await.unwrap(), Bytes::from_static(b"hello world"));
    }
}
