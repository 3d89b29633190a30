//! Pull-based chunked delivery of large artifacts
//!
//! A producer task slices the content into fixed-size chunks and pushes them
//! into a bounded channel. When the consumer stops pulling, the channel fills
//! and the producer suspends on `send` until a slot drains.

use crate::{CancellationSignal, ConvertError};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct ChunkStream {
    receiver: mpsc::Receiver<Result<Vec<u8>, ConvertError>>,
    produced: Arc<AtomicUsize>,
    total_chunks: usize,
    interrupted_reported: bool,
    producer: JoinHandle<()>,
}

impl ChunkStream {
    /// Start producing `content` in `chunk_size` pieces with at most
    /// `buffer_chunks` waiting for the consumer.
    pub fn spawn(
        content: Vec<u8>,
        chunk_size: usize,
        buffer_chunks: usize,
        cancel: CancellationSignal,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        let (sender, receiver) = mpsc::channel(buffer_chunks.max(1));
        let produced = Arc::new(AtomicUsize::new(0));
        let total_chunks = content.len().div_ceil(chunk_size);

        let counter = produced.clone();
        let producer = tokio::spawn(async move {
            for chunk in content.chunks(chunk_size) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Chunk production cancelled after {} chunks", counter.load(Ordering::Relaxed));
                        break;
                    }
                    sent = sender.send(Ok(chunk.to_vec())) => {
                        if sent.is_err() {
                            // Consumer dropped the stream.
                            break;
                        }
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        Self {
            receiver,
            produced,
            total_chunks,
            interrupted_reported: false,
            producer,
        }
    }

    /// Chunks handed to the channel so far.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Drain the stream into one buffer.
    pub async fn collect_all(mut self) -> Result<Vec<u8>, ConvertError> {
        use futures::StreamExt;

        let mut buffer = Vec::new();
        while let Some(chunk) = self.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer)
    }
}

impl Stream for ChunkStream {
    type Item = Result<Vec<u8>, ConvertError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            // The producer only stops early when cancelled; report it once
            // after the buffered chunks.
            Poll::Ready(None) if !self.interrupted_reported && self.produced() < self.total_chunks => {
                self.interrupted_reported = true;
                Poll::Ready(Some(Err(ConvertError::Cancelled)))
            }
            other => other,
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
