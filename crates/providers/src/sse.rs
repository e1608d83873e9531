//! Push-based Server-Sent Events parser.
//!
//! Both provider adapters and the MCP HTTP transport read SSE bodies as a
//! byte stream; this parser accepts arbitrary chunk boundaries and yields
//! complete events as they are terminated by a blank line.

/// A single Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, empty for unnamed events.
    pub event: String,
    /// Joined `data:` lines.
    pub data: String,
}

/// Incremental SSE parser. Feed it body chunks with [`SseParser::push`];
/// call [`SseParser::finish`] at end-of-stream to flush a trailing event
/// that was not followed by a blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            } else if let Some(event) = line.strip_prefix("event:") {
                self.event = event.trim().to_string();
            }
            // Comments (": ...") and unknown fields are ignored.
        }

        events
    }

    /// Flush any buffered event at end-of-stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.take_event()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event.clear();
            return None;
        }
        let event = SseEvent {
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_event() {
        let mut p = SseParser::new();
        let events = p.push("data: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(events[0].event.is_empty());
    }

    #[test]
    fn named_event() {
        let mut p = SseParser::new();
        let events = p.push("event: message_start\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message_start");
    }

    #[test]
    fn split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.push("da").is_empty());
        assert!(p.push("ta: hel").is_empty());
        assert!(p.push("lo\n").is_empty());
        let events = p.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn multiline_data_joined() {
        let mut p = SseParser::new();
        let events = p.push("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn crlf_lines() {
        let mut p = SseParser::new();
        let events = p.push("data: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn comments_ignored() {
        let mut p = SseParser::new();
        let events = p.push(": keepalive\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn data_without_space() {
        let mut p = SseParser::new();
        let events = p.push("data:tight\n\n");
        assert_eq!(events[0].data, "tight");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut p = SseParser::new();
        assert!(p.push("data: tail\n").is_empty());
        let event = p.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(p.finish().is_none());
    }

    #[test]
    fn event_name_resets_between_events() {
        let mut p = SseParser::new();
        let first = p.push("event: a\ndata: 1\n\n");
        assert_eq!(first[0].event, "a");
        let second = p.push("data: 2\n\n");
        assert_eq!(second[0].event, "");
    }
}
