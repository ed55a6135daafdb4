//! Server-sent events framing.
//!
//! Network reads split events at arbitrary byte offsets, so the decoder keeps
//! partial lines between calls and only yields an event once its terminating
//! blank line arrives.

use crate::error::LlmError;
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect every event they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

/// Whether the consumer wants more events.
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Drive a streaming response body through the decoder until the consumer
/// stops or the body ends. Fails with `Cancelled` when `cancel` fires and with
/// a network error when no bytes arrive for `idle_timeout`.
pub(crate) async fn read_events<F>(
    response: reqwest::Response,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    mut on_event: F,
) -> Result<(), LlmError>
where
    F: FnMut(SseEvent) -> Result<Flow, LlmError>,
{
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                Ok(next) => next,
                Err(_) => {
                    return Err(LlmError::NetworkError(format!(
                        "stream idle for {}s",
                        idle_timeout.as_secs_f64()
                    )))
                }
            },
        };
        match next {
            Some(Ok(bytes)) => {
                for event in decoder.push(&bytes) {
                    if let Flow::Stop = on_event(event)? {
                        return Ok(());
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }

    if let Some(event) = decoder.finish() {
        on_event(event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: s.to_string(),
        }
    }

    #[test]
    fn yields_one_event_per_blank_line() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: one\n\ndata: two\n\n");
        assert_eq!(events, vec![data("one"), data("two")]);
    }

    #[test]
    fn joins_events_split_across_reads() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"da").is_empty());
        assert!(decoder.push(b"ta: {\"a\":").is_empty());
        assert!(decoder.push(b"1}\n").is_empty());
        assert_eq!(decoder.push(b"\n"), vec![data("{\"a\":1}")]);
    }

    #[test]
    fn handles_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: hi\r\n\r\n");
        assert_eq!(events, vec![data("hi")]);
    }

    #[test]
    fn keeps_event_names_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\nevent: message_stop\ndata: {}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("message_stop".to_string()),
                data: "{}".to_string()
            }]
        );
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(events, vec![data("a\nb")]);
    }

    #[test]
    fn flushes_trailing_event_without_blank_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(data("[DONE]")));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn multibyte_characters_split_across_reads_survive() {
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(decoder.push(&text[split..]), vec![data("héllo")]);
    }
}
