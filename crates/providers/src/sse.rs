//! Shared plumbing for the adapters: an SSE line splitter and a chunk sink
//! that enforces the single-terminal-chunk contract.

use relayclaw_core::message::{MessageToolCall, Usage};
use relayclaw_core::provider::StreamChunk;
use tokio::sync::mpsc;

/// Capacity of every adapter's chunk channel.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// One meaningful line of a `text/event-stream` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseLine {
    /// `event: <name>`
    Event(String),
    /// `data: <payload>`
    Data(String),
}

/// Splits a byte stream into SSE lines.
///
/// Bytes may arrive split anywhere, including in the middle of a UTF-8
/// sequence, so raw bytes are buffered and only complete lines are decoded.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and drain every complete line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if let Some(line) = parse_line(text.trim_end_matches('\r')) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub(crate) fn finish(&mut self) -> Option<SseLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&raw);
        parse_line(text.trim_end_matches('\r'))
    }
}

fn parse_line(line: &str) -> Option<SseLine> {
    // Skip empty lines and SSE comments
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(event) = line.strip_prefix("event:") {
        return Some(SseLine::Event(event.trim().to_string()));
    }
    if let Some(data) = line.strip_prefix("data:") {
        return Some(SseLine::Data(data.trim().to_string()));
    }
    None
}

/// Sending half of an adapter's chunk stream.
///
/// Once a terminal chunk has gone out every later send is dropped, so the
/// receiver sees at most one `Done`/`Error` and it is always last.
pub(crate) struct ChunkSink {
    tx: mpsc::Sender<StreamChunk>,
    closed: bool,
}

impl ChunkSink {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        (Self { tx, closed: false }, rx)
    }

    /// Whether a terminal chunk was sent or the receiver went away.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one chunk. Returns false when the stream is finished, either
    /// because a terminal chunk went out or because the receiver was dropped.
    pub(crate) async fn send(&mut self, chunk: StreamChunk) -> bool {
        if self.closed {
            return false;
        }
        let terminal = chunk.is_terminal();
        if self.tx.send(chunk).await.is_err() {
            // receiver dropped
            self.closed = true;
            return false;
        }
        if terminal {
            self.closed = true;
        }
        !self.closed
    }

    pub(crate) async fn text(&mut self, content: impl Into<String>) -> bool {
        self.send(StreamChunk::Text(content.into())).await
    }

    pub(crate) async fn tool_call(&mut self, call: MessageToolCall) -> bool {
        self.send(StreamChunk::ToolCall(call)).await
    }

    pub(crate) async fn done(&mut self, usage: Option<Usage>) {
        self.send(StreamChunk::Done(usage)).await;
    }

    pub(crate) async fn error(&mut self, message: impl Into<String>) {
        self.send(StreamChunk::Error(message.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_pushes() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"event: message_st").is_empty());
        let lines = buf.push(b"art\r\ndata: {\"a\":1}\n\n: keep-alive\n");
        assert_eq!(
            lines,
            vec![
                SseLine::Event("message_start".into()),
                SseLine::Data("{\"a\":1}".into()),
            ]
        );
    }

    #[test]
    fn multibyte_split_is_preserved() {
        let mut buf = SseLineBuffer::new();
        let bytes = "data: héllo\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(buf.push(&bytes[..8]).is_empty());
        let lines = buf.push(&bytes[8..]);
        assert_eq!(lines, vec![SseLine::Data("héllo".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: [DONE]").is_empty());
        assert_eq!(buf.finish(), Some(SseLine::Data("[DONE]".into())));
        assert_eq!(buf.finish(), None);
    }

    #[tokio::test]
    async fn sink_drops_everything_after_terminal() {
        let (mut sink, mut rx) = ChunkSink::channel();
        assert!(sink.text("a").await);
        sink.done(None).await;
        assert!(sink.is_closed());
        assert!(!sink.text("late").await);
        sink.error("late error").await;
        drop(sink);

        let mut got = Vec::new();
        while let Some(c) = rx.recv().await {
            got.push(c);
        }
        assert_eq!(got, vec![StreamChunk::Text("a".into()), StreamChunk::Done(None)]);
    }
}
