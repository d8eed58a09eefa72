//! Source/sink pipeline used by in-process data planes
//!
//! A [`DataSource`] yields named [`Part`]s and a [`DataSink`] writes them.
//! Factories claim endpoints by transport type; [`PipelineService`] picks the
//! first factory that can handle each side of a transfer.

use async_trait::async_trait;
use bytes::Bytes;
use conduit_registry::TransportType;
use conduit_store::EndpointDescriptor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Transport type of plain filesystem endpoints
pub const FILE: &str = "FILE";

/// Transport type of sources whose payload travels in the `payload` property
pub const INLINE: &str = "INLINE";

/// Endpoint property holding an inline payload
pub const PAYLOAD_PROPERTY: &str = "payload";

/// Endpoint property naming the part produced by an inline source
pub const NAME_PROPERTY: &str = "name";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No source can read {0} endpoints")]
    UnsupportedSource(TransportType),

    #[error("No sink can write {0} endpoints")]
    UnsupportedSink(TransportType),

    #[error("Endpoint {address} is missing property '{key}'")]
    MissingProperty { address: String, key: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Error code reported in a `failed` notification
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedSource(_) => "SOURCE_UNSUPPORTED",
            PipelineError::UnsupportedSink(_) => "SINK_UNSUPPORTED",
            PipelineError::MissingProperty { .. } => "MISSING_PROPERTY",
            PipelineError::Io { .. } => "IO_ERROR",
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One named unit of payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub data: Bytes,
}

impl Part {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn read_parts(&self) -> Result<Vec<Part>, PipelineError>;
}

#[async_trait]
pub trait DataSink: Send + Sync {
    /// Write every part, returning the number of bytes written
    async fn write_parts(&self, parts: Vec<Part>) -> Result<u64, PipelineError>;
}

pub trait SourceFactory: Send + Sync {
    fn can_handle(&self, endpoint: &EndpointDescriptor) -> bool;

    fn create_source(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn DataSource>, PipelineError>;
}

pub trait SinkFactory: Send + Sync {
    fn can_handle(&self, endpoint: &EndpointDescriptor) -> bool;

    fn create_sink(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn DataSink>, PipelineError>;
}

fn is_transport(endpoint: &EndpointDescriptor, tag: &str) -> bool {
    endpoint.transport_type == TransportType::new(tag)
}

/// Reads a single file; the part is named after the file
pub struct FileSource {
    path: PathBuf,
}

#[async_trait]
impl DataSource for FileSource {
    async fn read_parts(&self) -> Result<Vec<Part>, PipelineError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| PipelineError::io(&self.path, e))?;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        Ok(vec![Part::new(name, data)])
    }
}

pub struct FileSourceFactory;

impl SourceFactory for FileSourceFactory {
    fn can_handle(&self, endpoint: &EndpointDescriptor) -> bool {
        is_transport(endpoint, FILE)
    }

    fn create_source(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn DataSource>, PipelineError> {
        Ok(Box::new(FileSource {
            path: PathBuf::from(&endpoint.address),
        }))
    }
}

/// Serves the payload carried in the endpoint itself
pub struct InlineSource {
    part: Part,
}

#[async_trait]
impl DataSource for InlineSource {
    async fn read_parts(&self) -> Result<Vec<Part>, PipelineError> {
        Ok(vec![self.part.clone()])
    }
}

pub struct InlineSourceFactory;

impl SourceFactory for InlineSourceFactory {
    fn can_handle(&self, endpoint: &EndpointDescriptor) -> bool {
        is_transport(endpoint, INLINE)
    }

    fn create_source(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn DataSource>, PipelineError> {
        let payload = endpoint
            .property(PAYLOAD_PROPERTY)
            .ok_or_else(|| PipelineError::MissingProperty {
                address: endpoint.address.clone(),
                key: PAYLOAD_PROPERTY.to_string(),
            })?;
        let name = endpoint.property(NAME_PROPERTY).unwrap_or(&endpoint.address);
        Ok(Box::new(InlineSource {
            part: Part::new(name, payload.as_bytes().to_vec()),
        }))
    }
}

/// Writes parts under a filesystem path
///
/// A single part is written to the path itself; several parts are written
/// into the path as a directory, one file per part name. Each file is staged
/// under a `.partial` name and renamed once fully written.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    async fn write_file(path: &Path, data: &[u8]) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PipelineError::io(parent, e))?;
            }
        }
        let mut staged = path.as_os_str().to_owned();
        staged.push(".partial");
        let staged = PathBuf::from(staged);

        tokio::fs::write(&staged, data)
            .await
            .map_err(|e| PipelineError::io(&staged, e))?;
        tokio::fs::rename(&staged, path)
            .await
            .map_err(|e| PipelineError::io(path, e))
    }
}

#[async_trait]
impl DataSink for FileSink {
    async fn write_parts(&self, parts: Vec<Part>) -> Result<u64, PipelineError> {
        let mut written = 0u64;
        if let [part] = parts.as_slice() {
            Self::write_file(&self.path, &part.data).await?;
            written += part.data.len() as u64;
        } else {
            for part in &parts {
                Self::write_file(&self.path.join(&part.name), &part.data).await?;
                written += part.data.len() as u64;
            }
        }
        debug!(path = %self.path.display(), parts = parts.len(), bytes = written, "Sink written");
        Ok(written)
    }
}

pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn can_handle(&self, endpoint: &EndpointDescriptor) -> bool {
        is_transport(endpoint, FILE)
    }

    fn create_sink(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn DataSink>, PipelineError> {
        Ok(Box::new(FileSink {
            path: PathBuf::from(&endpoint.address),
        }))
    }
}

/// Registered source and sink factories
#[derive(Default)]
pub struct PipelineService {
    sources: Vec<Arc<dyn SourceFactory>>,
    sinks: Vec<Arc<dyn SinkFactory>>,
}

impl PipelineService {
    /// Service without any factories
    pub fn new() -> Self {
        Self::default()
    }

    /// Service with the FILE and INLINE built-ins
    pub fn with_builtins() -> Self {
        let mut service = Self::new();
        service.register_source(Arc::new(FileSourceFactory));
        service.register_source(Arc::new(InlineSourceFactory));
        service.register_sink(Arc::new(FileSinkFactory));
        service
    }

    pub fn register_source(&mut self, factory: Arc<dyn SourceFactory>) {
        self.sources.push(factory);
    }

    pub fn register_sink(&mut self, factory: Arc<dyn SinkFactory>) {
        self.sinks.push(factory);
    }

    fn source_factory(&self, endpoint: &EndpointDescriptor) -> Result<&Arc<dyn SourceFactory>, PipelineError> {
        self.sources
            .iter()
            .find(|f| f.can_handle(endpoint))
            .ok_or_else(|| PipelineError::UnsupportedSource(endpoint.transport_type.clone()))
    }

    fn sink_factory(&self, endpoint: &EndpointDescriptor) -> Result<&Arc<dyn SinkFactory>, PipelineError> {
        self.sinks
            .iter()
            .find(|f| f.can_handle(endpoint))
            .ok_or_else(|| PipelineError::UnsupportedSink(endpoint.transport_type.clone()))
    }

    /// Check that both endpoints are served, without touching any data
    pub fn validate(
        &self,
        source: &EndpointDescriptor,
        destination: &EndpointDescriptor,
    ) -> Result<(), PipelineError> {
        self.source_factory(source)?;
        self.sink_factory(destination)?;
        Ok(())
    }

    /// Move every part from `source` to `destination`
    pub async fn transfer(
        &self,
        source: &EndpointDescriptor,
        destination: &EndpointDescriptor,
    ) -> Result<u64, PipelineError> {
        let reader = self.source_factory(source)?.create_source(source)?;
        let writer = self.sink_factory(destination)?.create_sink(destination)?;

        let parts = reader.read_parts().await?;
        writer.write_parts(parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_to_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.txt");
        let dst = dir.path().join("nested/out.txt");
        std::fs::write(&src, b"malo_123").unwrap();

        let service = PipelineService::with_builtins();
        let written = service
            .transfer(
                &EndpointDescriptor::new(src.to_string_lossy(), "file"),
                &EndpointDescriptor::new(dst.to_string_lossy(), "FILE"),
            )
            .await
            .unwrap();

        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&dst).unwrap(), b"malo_123");
        assert!(!dir.path().join("nested/out.txt.partial").exists());
    }

    #[tokio::test]
    async fn test_inline_source() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("inline.json");

        let source = EndpointDescriptor::new("customer", "Inline").with_property(PAYLOAD_PROPERTY, "{}");
        let service = PipelineService::with_builtins();
        service
            .transfer(&source, &EndpointDescriptor::new(dst.to_string_lossy(), "FILE"))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "{}");
    }

    #[test]
    fn test_inline_without_payload() {
        let err = InlineSourceFactory
            .create_source(&EndpointDescriptor::new("customer", INLINE))
            .err()
            .unwrap();
        assert_eq!(err.code(), "MISSING_PROPERTY");
    }

    #[test]
    fn test_validate_unsupported_sink() {
        let service = PipelineService::with_builtins();
        let err = service
            .validate(
                &EndpointDescriptor::new("/in", FILE),
                &EndpointDescriptor::new("container", "AZURE-BLOB"),
            )
            .unwrap_err();
        assert_eq!(err.code(), "SINK_UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_missing_source_file() {
        let dir = tempdir().unwrap();
        let service = PipelineService::with_builtins();
        let err = service
            .transfer(
                &EndpointDescriptor::new(dir.path().join("nope").to_string_lossy(), FILE),
                &EndpointDescriptor::new(dir.path().join("out").to_string_lossy(), FILE),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
