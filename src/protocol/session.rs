use std::sync::Arc;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::Mutex;

use super::error::ProtocolError;
use super::message::Message;

/// A duplex byte stream a session can run over (plain TCP or TLS).
pub trait AdcStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AdcStream for T {}

/// An ADC protocol session over one duplex stream.
///
/// The session owns the buffered read side. Writes go through a clonable
/// [`SessionWriter`] so any task can emit messages; the writer lock makes
/// each call atomic at the line boundary and flushes before returning
/// (the protocol is latency-sensitive, so no batching).
pub struct Session {
    reader: BufReader<ReadHalf<Box<dyn AdcStream>>>,
    writer: SessionWriter,
    line: String,
}

impl Session {
    pub fn new(stream: Box<dyn AdcStream>) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(r),
            writer: SessionWriter {
                inner: Arc::new(Mutex::new(w)),
            },
            line: String::new(),
        }
    }

    /// Reads one whole message, stripping the terminating newline.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.line.ends_with('\n') {
            self.line.pop();
        }
        Message::parse(&self.line)
    }

    /// Reads exactly `buf.len()` raw bytes from the stream.
    ///
    /// Binary payloads (tthl streams, file chunks) follow a SND message
    /// as raw bytes on the same stream.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.reader.read_exact(buf).await?;
        Ok(())
    }

    /// Reads up to `buf.len()` raw bytes, returning the count read.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let n = self.reader.read(buf).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(n)
    }

    /// Returns a clonable write handle for this session.
    pub fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    /// Writes one message line (without its newline).
    pub async fn write_line(&self, line: impl AsRef<str>) -> Result<(), ProtocolError> {
        self.writer.write_line(line).await
    }

    /// Shuts down the write side, which ends the conversation.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

/// Clonable single-writer handle to a session.
#[derive(Clone)]
pub struct SessionWriter {
    inner: Arc<Mutex<WriteHalf<Box<dyn AdcStream>>>>,
}

impl SessionWriter {
    /// Writes one message line. The newline is appended here; the whole
    /// line goes out in a single write under the lock.
    pub async fn write_line(&self, line: impl AsRef<str>) -> Result<(), ProtocolError> {
        let line = line.as_ref();
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let mut w = self.inner.lock().await;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// Shuts down the write side. Idempotent.
    pub async fn close(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}
