//! Decoding of `data:`-framed chat completion streams.
//!
//! [`StreamDecoder`] is a push parser: feed it byte chunks exactly as they come
//! off the wire and it hands back events for every complete line. Chunk
//! boundaries may fall anywhere, including inside a UTF-8 sequence or a JSON
//! frame; the only state carried between chunks is the unterminated tail of
//! the current line. [`DeltaStream`] drives a decoder from a response body.

use super::{LlmError, TransportResponse};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One incremental piece of an assistant reply. At least one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(ChatDelta),
    Done,
}

/// A `data:` line that could not be turned into a delta. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not decode stream line ({}): {}", self.reason, self.line)
    }
}

#[derive(Deserialize)]
struct StreamFrame {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: FrameDelta,
}

#[derive(Deserialize, Default)]
struct FrameDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

pub type Decoded = Result<StreamEvent, DecodeWarning>;

#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consumes one chunk and returns the outcome of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.pending.extend_from_slice(chunk);

        // '\n' never occurs inside a multi-byte sequence, so splitting raw
        // bytes on it keeps every character whole.
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if self.decode_into(&line[..pos], &mut out) {
                self.pending.clear();
                break;
            }
        }
        out
    }

    /// Flushes a final line that arrived without a trailing newline.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if !self.finished && !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.decode_into(&line, &mut out);
        }
        out
    }

    /// Returns true when the line was the terminating sentinel.
    fn decode_into(&mut self, raw: &[u8], out: &mut Vec<Decoded>) -> bool {
        let line = String::from_utf8_lossy(raw);
        match decode_line(&line) {
            Some(Ok(StreamEvent::Done)) => {
                self.finished = true;
                out.push(Ok(StreamEvent::Done));
                true
            }
            Some(decoded) => {
                out.push(decoded);
                false
            }
            None => false,
        }
    }
}

/// Decodes a single line. `None` means the line carries nothing of interest.
pub fn decode_line(line: &str) -> Option<Decoded> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix(DATA_PREFIX)?.trim();
    if data == DONE_SENTINEL {
        return Some(Ok(StreamEvent::Done));
    }

    let frame: StreamFrame = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(Err(DecodeWarning {
                line: data.to_string(),
                reason: e.to_string(),
            }))
        }
    };
    let Some(choice) = frame.choices.into_iter().next() else {
        return Some(Err(DecodeWarning {
            line: data.to_string(),
            reason: "frame has no choices".to_string(),
        }));
    };

    let delta = ChatDelta {
        content: choice.delta.content.filter(|s| !s.is_empty()),
        reasoning: choice.delta.reasoning_content.filter(|s| !s.is_empty()),
    };
    if delta.content.is_none() && delta.reasoning.is_none() {
        return None;
    }
    Some(Ok(StreamEvent::Delta(delta)))
}

/// Lazy, forward-only sequence of deltas read from a streaming response.
pub struct DeltaStream {
    body: BoxStream<'static, Result<Vec<u8>, LlmError>>,
    decoder: StreamDecoder,
    queue: VecDeque<Decoded>,
    exhausted: bool,
    warnings: usize,
}

impl DeltaStream {
    pub fn new(response: TransportResponse) -> Self {
        Self {
            body: response.body,
            decoder: StreamDecoder::new(),
            queue: VecDeque::new(),
            exhausted: false,
            warnings: 0,
        }
    }

    /// Number of lines skipped so far because they failed to decode.
    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Next delta, `None` once the sentinel is seen or the body ends.
    pub async fn next_delta(&mut self) -> Option<Result<ChatDelta, LlmError>> {
        loop {
            while let Some(decoded) = self.queue.pop_front() {
                match decoded {
                    Ok(StreamEvent::Delta(delta)) => return Some(Ok(delta)),
                    Ok(StreamEvent::Done) => {
                        self.queue.clear();
                        self.exhausted = true;
                        return None;
                    }
                    Err(warning) => {
                        self.warnings += 1;
                        tracing::warn!(line = %warning.line, reason = %warning.reason, "skipping malformed stream line");
                    }
                }
            }
            if self.exhausted {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.queue.extend(self.decoder.feed(&chunk)),
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
                None => {
                    self.queue.extend(self.decoder.finish());
                    self.exhausted = true;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChatDelta, LlmError>> {
        futures::stream::unfold(self, |mut deltas| async move {
            deltas.next_delta().await.map(|item| (item, deltas))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const HELLO: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
                         data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
                         data: [DONE]\n";

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Delta(ChatDelta {
            content: Some(text.to_string()),
            reasoning: None,
        })
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Decoded> {
        let mut decoder = StreamDecoder::new();
        let mut out: Vec<Decoded> = chunks.iter().flat_map(|c| decoder.feed(c)).collect();
        out.extend(decoder.finish());
        out
    }

    fn response(chunks: Vec<Vec<u8>>) -> TransportResponse {
        TransportResponse {
            status: 200,
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    #[test]
    fn decodes_hello_example() {
        let events = decode_chunks(&[HELLO.as_bytes()]);
        assert_eq!(
            events,
            vec![Ok(content("Hel")), Ok(content("lo")), Ok(StreamEvent::Done)]
        );
    }

    #[test]
    fn every_split_point_yields_same_events() {
        let frames = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo wörld 🦀\"}}]}\r\n\
                      \n\
                      : keep-alive\n\
                      data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"因为\"}}]}\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"✓\"}}]}\n\
                      data: [DONE]\n";
        let bytes = frames.as_bytes();
        let whole = decode_chunks(&[bytes]);
        assert_eq!(whole.len(), 4);

        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[a, b]), whole, "split at byte {split}");
        }
        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&single_bytes), whole);
    }

    #[test]
    fn sentinel_terminates_regardless_of_position() {
        let events = decode_chunks(&[b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n"]);
        assert_eq!(events, vec![Ok(StreamEvent::Done)]);

        let mut decoder = StreamDecoder::new();
        decoder.feed(b"data:[DONE]\n");
        assert!(decoder.is_finished());
        assert!(decoder.feed(HELLO.as_bytes()).is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn malformed_line_is_a_warning_not_an_abort() {
        let events = decode_chunks(&[
            b"data: {not json}\n",
            b"data: {\"choices\":[]}\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        ]);
        assert_eq!(events.len(), 3);
        assert!(events[0].is_err());
        assert_eq!(events[1].as_ref().unwrap_err().reason, "frame has no choices");
        assert_eq!(events[2], Ok(content("ok")));
    }

    #[test]
    fn empty_fragments_are_not_emitted() {
        let events = decode_chunks(&[
            b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn reasoning_and_content_travel_together() {
        let events = decode_chunks(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\",\"reasoning_content\":\"b\"}}]}",
        ]);
        assert_eq!(
            events,
            vec![Ok(StreamEvent::Delta(ChatDelta {
                content: Some("a".into()),
                reasoning: Some("b".into()),
            }))]
        );
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("event: ping"), None);
        assert_eq!(decode_line(" data: [DONE]"), None);
        assert_eq!(decode_line("data:   [DONE]  "), Some(Ok(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn delta_stream_reads_across_chunks() {
        let bytes = HELLO.as_bytes();
        let chunks = vec![bytes[..20].to_vec(), bytes[20..61].to_vec(), bytes[61..].to_vec()];
        let deltas: Vec<_> = DeltaStream::new(response(chunks)).into_stream().collect().await;
        let text: String = deltas
            .into_iter()
            .map(|d| d.unwrap().content.unwrap())
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn delta_stream_counts_warnings_and_stops_at_body_end() {
        let mut deltas = DeltaStream::new(response(vec![
            b"data: oops\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}".to_vec(),
        ]));
        let first = deltas.next_delta().await.unwrap().unwrap();
        assert_eq!(first.content.as_deref(), Some("x"));
        assert!(deltas.next_delta().await.is_none());
        assert!(deltas.next_delta().await.is_none());
        assert_eq!(deltas.warnings(), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let body = stream::iter(vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()),
            Err(LlmError::transport("connection reset")),
        ])
        .boxed();
        let mut deltas = DeltaStream::new(TransportResponse { status: 200, body });
        assert!(deltas.next_delta().await.unwrap().is_ok());
        assert!(matches!(deltas.next_delta().await, Some(Err(LlmError::Transport(_)))));
        assert!(deltas.next_delta().await.is_none());
    }
}
