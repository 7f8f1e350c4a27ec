//! Incremental parser for server-sent-event response streams

/// One parsed event from an SSE stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line
    Data(String),
    /// Terminal `[DONE]` marker
    Done,
}

/// Line-buffered SSE parser.
///
/// Network chunks split lines at arbitrary byte boundaries; the parser
/// buffers the trailing partial line across `push` calls.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = Self::parse_line(line.trim()) {
                let done = event == SseEvent::Done;
                events.push(event);
                if done {
                    break;
                }
            }
        }
        events
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" || payload == "DONE" {
            return Some(SseEvent::Done);
        }
        if payload.is_empty() {
            return None;
        }
        Some(SseEvent::Data(payload.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"x\":1}\n\n");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".to_string())]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"par").is_empty());
        let events = parser.push(b"tial\":true}\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"partial\":true}".to_string())]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\n\ndata: one\n");
        assert_eq!(events, vec![SseEvent::Data("one".to_string())]);
    }

    #[test]
    fn test_done_markers() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push(b"data: [DONE]\n"), vec![SseEvent::Done]);

        let mut parser = SseParser::new();
        assert_eq!(parser.push(b"data: DONE\n"), vec![SseEvent::Done]);
    }

    #[test]
    fn test_stops_at_done() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: a\ndata: [DONE]\ndata: b\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("a".to_string()), SseEvent::Done]
        );
    }
}
