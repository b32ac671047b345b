use bytes::Bytes;

/// One parsed `text/event-stream` event: an optional `event:` name and the
/// concatenation of every `data:` line, joined by `\n`.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Line-buffered SSE assembler. Feeding `feed(a)` then `feed(b)` yields the
/// same events as feeding `feed(a + b)` in one call — events only complete
/// on a blank line, so a split in the middle of a line or event just delays
/// completion until enough bytes have arrived.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }
            if line == "event" {
                self.event = None;
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
                continue;
            }
        }

        events
    }

    /// Flush any trailing partial line/event at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenation_matches_split_feed() {
        let whole = "event: message_stop\ndata: {\"a\":1}\n\n";
        let mut a = SseParser::new();
        let events_a = a.push_str(whole);

        let mut b = SseParser::new();
        let mut events_b = b.push_str(&whole[..10]);
        events_b.extend(b.push_str(&whole[10..]));

        assert_eq!(events_a.len(), 1);
        assert_eq!(events_a.len(), events_b.len());
        assert_eq!(events_a[0].data, events_b[0].data);
        assert_eq!(events_a[0].event, events_b[0].event);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut p = SseParser::new();
        let events = p.push_str(": keep-alive\ndata: ping\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ping");
    }

    #[test]
    fn finish_flushes_trailing_event_without_blank_line() {
        let mut p = SseParser::new();
        let events = p.push_str("data: partial");
        assert!(events.is_empty());
        let flushed = p.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, "partial");
    }
}
