//! Incremental line decoder.
//!
//! [`NdjsonDecoder`] turns arbitrarily chunked bytes into protocol messages.
//! Lines are split on raw `\n` bytes before UTF-8 decoding, so the output does
//! not depend on where chunk boundaries fall.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_stream::Stream;
use tracing::{debug, warn};

use super::parser::parse_line;
use super::types::{ErrorMessage, Message};
use crate::error::Error;

/// Read size used by [`message_stream`].
const READ_CHUNK: usize = 8 * 1024;

/// Longest trailing fragment quoted in a synthetic error.
const MAX_FRAGMENT_PREVIEW: usize = 200;

/// Counters describing what the decoder discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Lines turned into messages.
    pub messages: u64,
    /// Lines that were not valid JSON.
    pub decode_failures: u64,
    /// JSON lines without a usable `type` discriminator.
    pub schema_mismatches: u64,
}

/// Buffered NDJSON decoder.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    stats: DecoderStats,
}

enum LineOutcome {
    Blank,
    Message(Message),
    NotJson,
    NoDiscriminator,
}

fn decode_line(bytes: &[u8]) -> LineOutcome {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Blank;
    }
    match parse_line(line) {
        Ok(msg) => LineOutcome::Message(msg),
        Err(Error::Json(e)) => {
            debug!(error = %e, len = line.len(), "Dropping non-JSON stdout line");
            LineOutcome::NotJson
        }
        Err(e) => {
            debug!(error = %e, "Dropping JSON line without discriminator");
            LineOutcome::NoDiscriminator
        }
    }
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk; returns every message completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buf[from..].iter().position(|&b| b == b'\n') {
            let end = from + pos;
            let outcome = decode_line(&self.buf[start..end]);
            if let Some(msg) = self.record(outcome) {
                messages.push(msg);
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        messages
    }

    /// Flush the trailing fragment at end of stream.
    ///
    /// An empty or whitespace fragment yields nothing; a complete JSON object
    /// without a newline is parsed normally; anything else becomes a single
    /// synthetic error message so truncated output is not lost silently.
    pub fn finish(&mut self) -> Option<Message> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        match decode_line(&rest) {
            LineOutcome::NotJson => {
                self.stats.decode_failures += 1;
                let fragment = String::from_utf8_lossy(&rest);
                let fragment = fragment.trim();
                warn!(len = fragment.len(), "Stream ended with an unparseable fragment");
                Some(Message::Error(ErrorMessage {
                    message: format!(
                        "Stream ended with unparseable output: {}",
                        preview(fragment)
                    ),
                    synthetic: true,
                }))
            }
            outcome => self.record(outcome),
        }
    }

    fn record(&mut self, outcome: LineOutcome) -> Option<Message> {
        match outcome {
            LineOutcome::Blank => None,
            LineOutcome::Message(msg) => {
                self.stats.messages += 1;
                Some(msg)
            }
            LineOutcome::NotJson => {
                self.stats.decode_failures += 1;
                None
            }
            LineOutcome::NoDiscriminator => {
                self.stats.schema_mismatches += 1;
                None
            }
        }
    }
}

fn preview(fragment: &str) -> String {
    if fragment.chars().count() <= MAX_FRAGMENT_PREVIEW {
        return fragment.to_string();
    }
    let mut cut: String = fragment.chars().take(MAX_FRAGMENT_PREVIEW).collect();
    cut.push('…');
    cut
}

/// Lazily decode messages from an async byte source.
///
/// The stream is forward-only: it ends when the reader reaches EOF or fails,
/// after flushing the trailing fragment through [`NdjsonDecoder::finish`].
pub fn message_stream<R>(reader: R) -> impl Stream<Item = Message>
where
    R: AsyncRead + Unpin,
{
    async_stream::stream! {
        let mut reader = reader;
        let mut decoder = NdjsonDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for msg in decoder.push(&chunk[..n]) {
                        yield msg;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Read error on agent stream");
                    break;
                }
            }
        }
        if let Some(msg) = decoder.finish() {
            yield msg;
        }
        let stats = decoder.stats();
        debug!(
            messages = stats.messages,
            decode_failures = stats.decode_failures,
            schema_mismatches = stats.schema_mismatches,
            "Agent stream finished"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    const SAMPLE: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s-1","model":"m"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"héllo wörld"}]}}"#,
        "\n",
        "garbage line\n",
        "\n",
        r#"{"no_type":true}"#,
        "\r\n",
        r#"{"type":"result","cost_usd":0.02,"session_id":"s-1"}"#,
        "\n",
    );

    fn decode_all(chunks: &[&[u8]]) -> Vec<Message> {
        let mut decoder = NdjsonDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    #[test]
    fn whole_input_decodes_valid_lines_only() {
        let mut decoder = NdjsonDecoder::new();
        let msgs = decoder.push(SAMPLE.as_bytes());
        assert_eq!(msgs.len(), 3);
        assert_eq!(decoder.finish(), None);
        let stats = decoder.stats();
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.schema_mismatches, 1);
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let bytes = SAMPLE.as_bytes();
        let reference = decode_all(&[bytes]);

        for size in [1, 2, 3, 5, 7, 16, 64] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_all(&chunks), reference, "chunk size {size}");
        }
        for split in 0..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_all(&[a, b]), reference, "split at {split}");
        }
    }

    #[test]
    fn trailing_garbage_yields_one_synthetic_error() {
        let mut decoder = NdjsonDecoder::new();
        let msgs = decoder.push(b"{\"type\":\"user\",\"message\":{\"content\":\"x\"}}\n{\"type\":\"assis");
        assert_eq!(msgs.len(), 1);
        assert!(decoder.pending_len() > 0);
        let Some(Message::Error(err)) = decoder.finish() else {
            panic!("expected synthetic error");
        };
        assert!(err.synthetic);
        assert!(err.message.contains("{\"type\":\"assis"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn trailing_whitespace_yields_nothing() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"type\":\"system\"}\n   \t ");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn unterminated_complete_object_is_parsed() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(br#"{"type":"result","cost_usd":1.0}"#).is_empty());
        assert!(matches!(decoder.finish(), Some(Message::Result(_))));
    }

    #[test]
    fn long_fragment_preview_is_truncated() {
        let long = "x".repeat(500);
        let mut decoder = NdjsonDecoder::new();
        decoder.push(long.as_bytes());
        let Some(Message::Error(err)) = decoder.finish() else {
            panic!("expected synthetic error");
        };
        assert!(err.message.ends_with('…'));
        assert!(err.message.len() < 300);
    }

    #[test]
    fn long_line_in_tiny_chunks_decodes_once_complete() {
        let text = "y".repeat(64 * 1024);
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{text}"}}]}}}}"#
        );
        let mut decoder = NdjsonDecoder::new();
        for chunk in line.as_bytes().chunks(7) {
            assert!(decoder.push(chunk).is_empty());
        }
        assert_eq!(decoder.pending_len(), line.len());

        let out = decoder.push(b"\n{\"type\":\"result\"}\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Message::Assistant(_)));
        assert!(matches!(out[1], Message::Result(_)));
        assert_eq!(decoder.pending_len(), 0);
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_messages_then_trailing_error() {
        let input = format!("{SAMPLE}not-json-tail");
        let stream = message_stream(input.as_bytes());
        tokio::pin!(stream);
        let mut kinds = Vec::new();
        while let Some(msg) = stream.next().await {
            kinds.push(msg.type_name().to_string());
        }
        assert_eq!(kinds, vec!["system", "assistant", "result", "error"]);
    }
}
