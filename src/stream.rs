//! Streaming response plumbing.
//!
//! The caller's write callback runs on a blocking worker and feeds chunks through a bounded
//! channel into the response body. The loop runs until the callback reports an error; that error
//! ends the stream silently and never reaches the dispatcher.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::sync::mpsc;

/// Write handle passed to a stream callback.
pub struct StreamWriter {
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
}

impl StreamWriter {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, buf: BytesMut::new() }
    }

    /// Buffers `data` into the current chunk.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    pub fn write_string(&mut self, data: &str) -> io::Result<usize> {
        self.write(data.as_bytes())
    }

    /// Sends the buffered chunk to the client. Fails once the client is gone.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let chunk = self.buf.split().freeze();
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream receiver closed"))
    }
}

pub(crate) type StreamFn = Box<dyn FnMut(&mut StreamWriter) -> io::Result<()> + Send>;

/// Drives `step` repeatedly on a blocking worker.
///
/// Each successful pass flushes what the callback wrote; a callback error stops the loop and
/// discards any unflushed partial write.
pub(crate) fn spawn_stream(mut step: StreamFn) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);

    tokio::task::spawn_blocking(move || {
        let mut writer = StreamWriter::new(tx);
        loop {
            if step(&mut writer).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunks_arrive_until_the_callback_errors() {
        let mut remaining = 3u32;
        let mut rx = spawn_stream(Box::new(move |w| {
            if remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "done"));
            }
            w.write_string(&format!("chunk-{remaining}"))?;
            remaining -= 1;
            Ok(())
        }));

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.push(String::from_utf8(chunk.to_vec()).unwrap());
        }

        assert_eq!(collected, vec!["chunk-3", "chunk-2", "chunk-1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_write_is_discarded_on_error() {
        let mut first = true;
        let mut rx = spawn_stream(Box::new(move |w| {
            if first {
                first = false;
                w.write_string("flushed")?;
                return Ok(());
            }
            // written but never flushed: the error discards it
            w.write_string("lost")?;
            Err(io::Error::new(io::ErrorKind::Other, "stop"))
        }));

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.push(String::from_utf8(chunk.to_vec()).unwrap());
        }

        assert_eq!(collected, vec!["flushed"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_flush_splits_chunks() {
        let mut done = false;
        let mut rx = spawn_stream(Box::new(move |w| {
            if done {
                return Err(io::Error::new(io::ErrorKind::Other, "done"));
            }
            done = true;
            w.write_string("a")?;
            w.flush()?;
            w.write_string("b")?;
            Ok(())
        }));

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.push(String::from_utf8(chunk.to_vec()).unwrap());
        }

        assert_eq!(collected, vec!["a", "b"]);
    }
}
