use std::{
    io,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::AsyncWrite;

use crate::error::Result;

pub type SinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where an aggregator writes its report.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSink {
    /// Created or truncated on open.
    File { path: PathBuf },
    Stdout,
    Stderr,
    /// In-memory sink, not configurable from files.
    #[serde(skip)]
    Buffer(SharedBuffer),
}

impl DataSink {
    pub async fn open(&self) -> Result<SinkWriter> {
        Ok(match self {
            DataSink::File { path } => Box::new(tokio::fs::File::create(path).await?),
            DataSink::Stdout => Box::new(tokio::io::stdout()),
            DataSink::Stderr => Box::new(tokio::io::stderr()),
            DataSink::Buffer(buffer) => Box::new(buffer.clone()),
        })
    }
}

/// Growable byte buffer shared between a sink and whoever inspects it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
