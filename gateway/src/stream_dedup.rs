//! Suppress consecutive-duplicate `delta.content` chunks in an SSE byte
//! stream, preserving event framing and the terminal `[DONE]` sentinel.

use bytes::Bytes;
use serde_json::Value;

const EVENT_SEPARATOR: &str = "\n\n";

/// Transforms one SSE byte stream into a deduplicated one. Owns a byte
/// buffer for partial events and a "last emitted content" marker scoped to
/// this single transform.
#[derive(Default)]
pub struct StreamDedup {
    buffer: String,
    last_content: Option<String>,
    dropped: u64,
}

impl StreamDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of adjacent-duplicate events dropped so far, for metrics.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Feed in a new chunk of upstream bytes, returning any complete,
    /// possibly-filtered events ready to forward to the client.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = String::new();
        while let Some(idx) = self.buffer.find(EVENT_SEPARATOR) {
            let event = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + EVENT_SEPARATOR.len());
            match self.process_event(&event) {
                Some(forwarded) => {
                    out.push_str(&forwarded);
                    out.push_str(EVENT_SEPARATOR);
                }
                None => self.dropped += 1,
            }
        }
        Bytes::from(out.into_bytes())
    }

    /// Emit any unterminated trailing bytes and reset the dedup marker.
    pub fn flush(&mut self) -> Bytes {
        let remainder = std::mem::take(&mut self.buffer);
        self.last_content = None;
        Bytes::from(remainder.into_bytes())
    }

    fn process_event(&mut self, event: &str) -> Option<String> {
        let Some(data) = event.strip_prefix("data: ").or_else(|| event.strip_prefix("data:")) else {
            return Some(event.to_string());
        };
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            return Some(event.to_string());
        }

        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => return Some(event.to_string()),
        };

        let content = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());

        match content {
            Some(content) => {
                if self.last_content.as_deref() == Some(content) {
                    None
                } else {
                    self.last_content = Some(content.to_string());
                    Some(event.to_string())
                }
            }
            None => Some(event.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse_event(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}"
        )
    }

    #[test]
    fn drops_adjacent_duplicate_deltas() {
        let mut dedup = StreamDedup::new();
        let input = format!(
            "{}\n\n{}\n\n{}\n\ndata: [DONE]\n\n",
            sse_event("hello"),
            sse_event("hello"),
            sse_event("world")
        );
        let out = dedup.push(input.as_bytes());
        let text = String::from_utf8(out.to_vec()).unwrap();
        let events: Vec<&str> = text.split("\n\n").filter(|s| !s.is_empty()).collect();
        assert_eq!(events.len(), 3);
        assert!(events[0].contains("hello"));
        assert!(events[1].contains("world"));
        assert!(events[2].contains("[DONE]"));
    }

    #[test]
    fn non_adjacent_duplicates_are_both_kept() {
        let mut dedup = StreamDedup::new();
        let input = format!(
            "{}\n\n{}\n\n{}\n\n",
            sse_event("a"),
            sse_event("b"),
            sse_event("a")
        );
        let out = dedup.push(input.as_bytes());
        let text = String::from_utf8(out.to_vec()).unwrap();
        let events: Vec<&str> = text.split("\n\n").filter(|s| !s.is_empty()).collect();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn malformed_json_is_passed_through_unfiltered() {
        let mut dedup = StreamDedup::new();
        let input = "data: not-json\n\n";
        let out = dedup.push(input.as_bytes());
        assert_eq!(String::from_utf8(out.to_vec()).unwrap(), input);
    }

    #[test]
    fn flush_emits_trailing_partial_bytes_and_resets_marker() {
        let mut dedup = StreamDedup::new();
        let _ = dedup.push(sse_event("partial").as_bytes());
        let flushed = dedup.flush();
        assert!(!flushed.is_empty());
        assert!(dedup.last_content.is_none());
    }
}
