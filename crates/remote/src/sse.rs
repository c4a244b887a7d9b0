//! Incremental parser for the `text/event-stream` wire format.
//!
//! Bytes arrive in arbitrary chunks; complete lines are processed as soon
//! as they are available and an event is emitted at each blank line.
//! `:`-prefixed comment lines (keepalives) are dropped.

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, when the server names the event.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    /// Bytes after the last complete line. Kept as bytes so that a UTF-8
    /// sequence split across chunks is decoded whole.
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
            start = end + 1;
            if let Some(frame) = self.line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        self.pending.drain(..start);

        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            return Some(SseFrame {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
                id: self.id.take(),
            });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_event() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: {\"processedCount\":5}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, r#"{"processedCount":5}"#);
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn named_event_with_id() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"id: 7\nevent: progress\ndata: x\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("progress"));
        assert_eq!(frames[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn keepalive_comments_are_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b": ping\n\n").is_empty());
    }

    #[test]
    fn chunks_split_anywhere() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"da").is_empty());
        assert!(parser.feed(b"ta: he").is_empty());
        let frames = parser.feed(b"llo\r\n\r\n");
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let text = "data: café\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(parser.feed(&text[..split]).is_empty());
        let frames = parser.feed(&text[split..]);
        assert_eq!(frames[0].data, "café");
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data:1\n\ndata:2\n\n");
        let data: Vec<_> = frames.iter().map(|f| f.data.as_str()).collect();
        assert_eq!(data, ["1", "2"]);
    }
}
