use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;

use stepgraph_core::error::{Result, StepGraphError};

/// Parse a raw SSE byte stream into individual events.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        // Some servers (Ollama behind proxies) send CRLF line endings. A `\r`
        // at the end of the buffer waits for the next chunk.
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// A stream of SSE events from raw bytes.
///
/// Transport errors surface as `LlmStream` items instead of silently ending
/// the stream, so a truncated response is never mistaken for a short one.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    // Bytes of a UTF-8 sequence split across chunks
    carry: Vec<u8>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            carry: Vec::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let ready = decodable_len(&this.carry);
                    let text: Vec<u8> = this.carry.drain(..ready).collect();
                    let text = String::from_utf8_lossy(&text);
                    this.pending.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(StepGraphError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if !this.carry.is_empty() {
                        this.carry.clear();
                        return Poll::Ready(Some(Err(StepGraphError::LlmStream(
                            "stream ended inside a UTF-8 sequence".into(),
                        ))));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Length of the prefix of `bytes` that can be decoded now.
///
/// Invalid bytes are included and decode to U+FFFD. Only a sequence cut off
/// at the very end is held back for the next chunk.
fn decodable_len(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                Some(invalid) => start += e.valid_up_to() + invalid,
                None => return start + e.valid_up_to(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message\ndata: {\"type\":\"chunk\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"type\":\"chunk\"}");
    }

    #[test]
    fn test_sse_parser_multiple_events() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"x\":1}\n\ndata: {\"x\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert!(events[0].event_type.is_none());
    }

    #[test]
    fn test_sse_parser_chunked() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"x\":");
        assert_eq!(events.len(), 0);
        let events = parser.feed("1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_sse_parser_crlf_and_no_space() {
        let mut parser = SseParser::new();
        let events = parser.feed("data:[DONE]\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn test_sse_parser_crlf_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: x\r").is_empty());
        let events = parser.feed("\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");

        assert!(parser.feed("data: y\r\n\r").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "y");
    }

    #[tokio::test]
    async fn test_sse_stream_reassembles_split_utf8() {
        use futures::StreamExt;

        // "é" is two bytes; split it across chunks
        let body = "data: caf\u{e9}\n\n".as_bytes().to_vec();
        let split = body.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let chunks: Vec<std::result::Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::copy_from_slice(&body[..split])),
            Ok(bytes::Bytes::copy_from_slice(&body[split..])),
        ];

        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().data, "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_sse_stream_replaces_invalid_utf8() {
        use futures::StreamExt;

        let chunks: Vec<std::result::Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"data: a\xFFb\n\n")),
            Ok(bytes::Bytes::from_static(b"data: {\"x\":1}\n\n")),
            Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n")),
        ];

        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks)).collect().await;
        let data: Vec<_> = events.iter().map(|e| e.as_ref().unwrap().data.as_str()).collect();
        assert_eq!(data, vec!["a\u{FFFD}b", "{\"x\":1}", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_sse_stream_truncated_utf8_at_end_is_error() {
        use futures::StreamExt;

        let chunks: Vec<std::result::Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"data: ok\n\n")),
            Ok(bytes::Bytes::from_static(b"data: caf\xC3")),
        ];

        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().data, "ok");
        assert!(matches!(events[1], Err(StepGraphError::LlmStream(_))));
    }
}
