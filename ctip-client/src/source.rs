//! Payload sources and the client-side resource resolver.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use ctip_core::{CtipError, MetaSource};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Chunk size for streamed uploads.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// A payload the client can stream to the server: the main document or an
/// auxiliary resource.
#[async_trait]
pub trait Source: Send {
    /// Metadata announced before the payload bytes.
    fn meta(&self) -> MetaSource;

    /// The next chunk of the payload, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, CtipError>;
}

/// Resolves resource URIs the server cannot fetch itself.
#[async_trait]
pub trait SourceResolver: Send {
    /// Produce a source for `uri`. `CtipError::ResourceNotFound` (or any
    /// other error) makes the session answer with MISSING_RESOURCE.
    async fn resolve(&mut self, uri: &str) -> Result<Box<dyn Source>, CtipError>;
}

/// An in-memory payload.
pub struct MemorySource {
    meta: MetaSource,
    remaining: Bytes,
}

impl MemorySource {
    pub fn new(meta: MetaSource, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let meta = MetaSource {
            length: Some(data.len() as u64),
            ..meta
        };
        Self {
            meta,
            remaining: data,
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    fn meta(&self) -> MetaSource {
        self.meta.clone()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, CtipError> {
        if self.remaining.is_empty() {
            return Ok(None);
        }
        let take = self.remaining.len().min(CHUNK_SIZE);
        Ok(Some(self.remaining.split_to(take)))
    }
}

/// A payload read from the local filesystem.
pub struct FileSource {
    meta: MetaSource,
    file: File,
}

impl FileSource {
    pub async fn open(
        path: impl AsRef<Path>,
        mime_type: Option<String>,
        encoding: Option<String>,
    ) -> Result<Self, CtipError> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        let meta = MetaSource::new(
            format!("file:{}", path.display()),
            mime_type,
            encoding,
            Some(length),
        );
        Ok(Self { meta, file })
    }
}

#[async_trait]
impl Source for FileSource {
    fn meta(&self) -> MetaSource {
        self.meta.clone()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, CtipError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_chunks() {
        let data = vec![7u8; CHUNK_SIZE + 100];
        let mut src = MemorySource::new(MetaSource::uri_only("mem"), data.clone());
        assert_eq!(src.meta().length, Some(data.len() as u64));

        let first = src.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        let second = src.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 100);
        assert!(src.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_source_reads_to_eof() {
        let dir = std::env::temp_dir().join("ctip-client-source-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("doc.html");
        tokio::fs::write(&path, b"<html>hi</html>").await.unwrap();

        let mut src = FileSource::open(&path, Some("text/html".into()), None)
            .await
            .unwrap();
        assert_eq!(src.meta().length, Some(15));
        let chunk = src.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"<html>hi</html>");
        assert!(src.next_chunk().await.unwrap().is_none());
    }
}
