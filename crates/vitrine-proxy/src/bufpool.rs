use std::io;
use std::sync::Mutex;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn write_all_timed<W>(sink: &mut W, bytes: &[u8], timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, sink.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        )),
    }
}

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const MAX_POOLED_BUFFERS: usize = 64;

/// Free list of fixed-capacity byte buffers used for response body
/// copying, so a busy proxy does not allocate one scratch buffer per
/// request. `get` hands out a cleared buffer; `put` keeps the capacity
/// and discards the contents.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let reused = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop());
        match reused {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(self.buffer_size),
        }
    }

    pub fn put(&self, buffer: Vec<u8>) {
        if buffer.capacity() < self.buffer_size {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOLED_BUFFERS {
                free.push(buffer);
            }
        }
    }

    /// Streams a response body into `sink` through one pooled buffer,
    /// flushing whenever the buffer fills. Each write carries its own
    /// deadline. Returns the bytes written.
    pub async fn copy_body<W>(
        &self,
        mut body: Incoming,
        sink: &mut W,
        write_timeout: Duration,
    ) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = self.get();
        let mut total = 0_u64;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(io::Error::other)?;
            let Ok(data) = frame.into_data() else {
                continue;
            };

            let mut remaining = data.as_ref();
            while !remaining.is_empty() {
                let room = self.buffer_size - buffer.len();
                let take = room.min(remaining.len());
                buffer.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];

                if buffer.len() == self.buffer_size {
                    write_all_timed(sink, &buffer, write_timeout).await?;
                    total += buffer.len() as u64;
                    buffer.clear();
                }
            }
        }

        if !buffer.is_empty() {
            write_all_timed(sink, &buffer, write_timeout).await?;
            total += buffer.len() as u64;
        }
        sink.flush().await?;

        self.put(buffer);
        Ok(total)
    }
}
