// src/runtime/sse.rs — Incremental SSE decoding
//
// The response body of the streaming endpoint is framed as newline-delimited
// `data: <json>` records. Network reads split the body at arbitrary byte
// boundaries, so decoding keeps a cross-chunk buffer: a line that arrives
// split across two reads is reassembled, never dropped or duplicated.

use serde_json::Value;
use tracing::warn;

use super::events::{parse_event, WorkflowEvent};

const DATA_PREFIX: &str = "data:";

/// Splits an incrementally received byte stream into complete lines.
/// Bytes after the last newline stay buffered until the next push.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the complete lines it unlocked, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            lines.push(
                String::from_utf8_lossy(line)
                    .trim_end_matches('\r')
                    .to_string(),
            );
        }
        lines
    }

    /// The trailing partial line once the stream has ended, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// Stateful decoder from raw body chunks to workflow events.
///
/// Tracks the most recent textual payload so that a stream ending without an
/// explicit terminal marker still resolves to the last-seen text: `finish`
/// synthesizes the terminal event in that case. After a terminal event has
/// been produced the decoder ignores further input.
pub struct SseDecoder {
    lines: LineBuffer,
    last_text: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            last_text: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode one body chunk into zero or more events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if self.done {
                break;
            }
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush the trailing line and close the stream. Returns the terminal
    /// event (decoded from the tail, or synthesized from the last-seen text)
    /// unless one was already produced.
    pub fn finish(&mut self) -> Option<WorkflowEvent> {
        if self.done {
            return None;
        }
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.decode_line(&line) {
                if self.done {
                    return Some(event);
                }
                // A trailing non-terminal event has no consumer ordering
                // problem: the synthesized terminal still goes last, so we
                // hand back the terminal carrying its text if it had any.
                if let WorkflowEvent::TextDelta { ref text, .. } = event {
                    if !text.is_empty() {
                        self.last_text = Some(text.clone());
                    }
                }
            }
        }
        self.done = true;
        Some(WorkflowEvent::Terminal {
            text: self.last_text.take(),
        })
    }

    fn decode_line(&mut self, line: &str) -> Option<WorkflowEvent> {
        let payload = line.strip_prefix(DATA_PREFIX)?.trim();
        if payload.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping malformed stream record");
                return None;
            }
        };
        match parse_event(&value)? {
            WorkflowEvent::Terminal { text } => {
                self.done = true;
                // Terminal records may omit the text; confirm with the
                // last-seen payload so the stream always resolves.
                Some(WorkflowEvent::Terminal {
                    text: text.or_else(|| self.last_text.clone()),
                })
            }
            event => {
                if let WorkflowEvent::TextDelta { ref text, .. } = event {
                    if !text.is_empty() {
                        self.last_text = Some(text.clone());
                    }
                }
                Some(event)
            }
        }
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TRANSCRIPT: &[u8] = b"data: {\"author\":\"a\",\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"search\"}}]}}\n\ndata: {\"terminal\":true,\"text\":\"done\"}\n\n";

    /// Run the full transcript through a fresh decoder with the given chunking.
    fn decode_chunked(bytes: &[u8], chunk_sizes: &[usize]) -> Vec<WorkflowEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        let mut offset = 0;
        for &size in chunk_sizes.iter().cycle() {
            if offset >= bytes.len() {
                break;
            }
            let end = (offset + size).min(bytes.len());
            events.extend(decoder.push(&bytes[offset..end]));
            offset = end;
        }
        if let Some(terminal) = decoder.finish() {
            events.push(terminal);
        }
        events
    }

    #[test]
    fn test_transcript_decodes_in_order() {
        let events = decode_chunked(TRANSCRIPT, &[TRANSCRIPT.len()]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            WorkflowEvent::FunctionCall {
                author: "a".into(),
                name: "search".into(),
                args: serde_json::Value::Null,
            }
        );
        assert_eq!(
            events[1],
            WorkflowEvent::Terminal {
                text: Some("done".into())
            }
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_events() {
        let reference = decode_chunked(TRANSCRIPT, &[TRANSCRIPT.len()]);
        // Byte-at-a-time, odd sizes, mid-line splits: all partitions must
        // produce exactly the reference event sequence.
        for sizes in [&[1][..], &[2][..], &[3, 7][..], &[13][..], &[40, 1][..]] {
            assert_eq!(decode_chunked(TRANSCRIPT, sizes), reference);
        }
    }

    #[test]
    fn test_multibyte_text_split_mid_character() {
        let bytes = "data: {\"terminal\":true,\"text\":\"héllo wörld\"}\n".as_bytes();
        let reference = decode_chunked(bytes, &[bytes.len()]);
        for sizes in [&[1][..], &[5][..], &[7, 2][..]] {
            assert_eq!(decode_chunked(bytes, sizes), reference);
        }
        assert_eq!(
            reference,
            vec![WorkflowEvent::Terminal {
                text: Some("héllo wörld".into())
            }]
        );
    }

    #[test]
    fn test_missing_terminal_synthesized_from_last_text() {
        let bytes =
            b"data: {\"type\":\"message\",\"author\":\"agent\",\"content\":\"partial answer\"}\n";
        let events = decode_chunked(bytes, &[bytes.len()]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            WorkflowEvent::Terminal {
                text: Some("partial answer".into())
            }
        );
    }

    #[test]
    fn test_trailing_line_without_newline_is_not_lost() {
        let bytes = b"data: {\"terminal\":true,\"text\":\"tail\"}";
        let events = decode_chunked(bytes, &[4]);
        assert_eq!(
            events,
            vec![WorkflowEvent::Terminal {
                text: Some("tail".into())
            }]
        );
    }

    #[test]
    fn test_terminal_without_text_confirms_last_seen() {
        let bytes = b"data: {\"type\":\"message\",\"author\":\"agent\",\"content\":\"the reply\"}\ndata: {\"type\":\"end\"}\n";
        let events = decode_chunked(bytes, &[9]);
        assert_eq!(
            events.last().unwrap(),
            &WorkflowEvent::Terminal {
                text: Some("the reply".into())
            }
        );
    }

    #[test]
    fn test_malformed_json_is_skipped() {
        let bytes = b"data: {not json}\ndata: {\"terminal\":true,\"text\":\"ok\"}\n";
        let events = decode_chunked(bytes, &[bytes.len()]);
        assert_eq!(
            events,
            vec![WorkflowEvent::Terminal {
                text: Some("ok".into())
            }]
        );
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let bytes = b": comment\nevent: ping\ndata: {\"terminal\":true,\"text\":\"ok\"}\n";
        let events = decode_chunked(bytes, &[6]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_crlf_line_endings() {
        let bytes = b"data: {\"terminal\":true,\"text\":\"ok\"}\r\n";
        let events = decode_chunked(bytes, &[3]);
        assert_eq!(
            events,
            vec![WorkflowEvent::Terminal {
                text: Some("ok".into())
            }]
        );
    }

    #[test]
    fn test_no_input_after_terminal() {
        let mut decoder = SseDecoder::new();
        let first = decoder.push(b"data: {\"terminal\":true,\"text\":\"done\"}\n");
        assert_eq!(first.len(), 1);
        assert!(decoder.is_done());
        let late = decoder.push(b"data: {\"author\":\"straggler\"}\n");
        assert!(late.is_empty());
        assert_eq!(decoder.finish(), None);
    }
}
