use crate::error::{Result, StokerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope kind. Request/response/error participate in correlation;
/// event envelopes are unsolicited in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Error,
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// The structured message unit exchanged over a process's stdio.
///
/// Serialized as exactly one JSON document per line; serde_json escapes any
/// newline inside string values, so a serialized envelope never spans lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Per-kind payload shape validation.
    ///
    /// Error envelopes must carry an object with a string `message` so the
    /// receiver can turn them into a meaningful rejection.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StokerError::InvalidEnvelope("empty id".to_string()));
        }
        if self.kind == MessageKind::Error && self.error_message().is_none() {
            return Err(StokerError::InvalidEnvelope(
                "error payload must be an object with a string `message`".to_string(),
            ));
        }
        Ok(())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// Serialize to a single newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| StokerError::SerializationError(e.to_string()))?;
        debug_assert!(!line.contains('\n'));
        line.push('\n');
        Ok(line)
    }
}

/// A unit parsed off a process's output stream: either a structured
/// envelope or a raw line that was not valid envelope JSON (legacy output,
/// never dropped).
#[derive(Debug, Clone)]
pub enum Inbound {
    Envelope(Envelope),
    Raw(String),
}

/// Newline framing over an unstructured byte stream.
///
/// Bytes accumulate until a newline completes a line; the trailing
/// incomplete fragment is retained across pushes, so a logical line split
/// over any number of reads parses exactly once and no byte is ever
/// skipped or double-processed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return everything it completed
    pub fn push(&mut self, data: &[u8]) -> Vec<Inbound> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            out.push(Self::parse_line(&line));
        }
        out
    }

    /// Bytes currently buffered without a terminating newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn parse_line(line: &[u8]) -> Inbound {
        match serde_json::from_slice::<Envelope>(line) {
            Ok(envelope) if envelope.validate().is_ok() => Inbound::Envelope(envelope),
            _ => Inbound::Raw(String::from_utf8_lossy(line).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            "req-1",
            MessageKind::Request,
            json!({"prompt": "say hello", "options": {"stream": true}}),
        )
    }

    #[test]
    fn test_round_trip_through_line_buffer() {
        let envelope = sample_envelope();
        let line = envelope.to_line().unwrap();

        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(line.as_bytes());

        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            Inbound::Envelope(e) => assert_eq!(*e, envelope),
            Inbound::Raw(raw) => panic!("expected envelope, got raw: {}", raw),
        }
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_embedded_newline_in_payload_is_escaped() {
        let envelope = Envelope::new(
            "req-2",
            MessageKind::Request,
            json!({"prompt": "line one\nline two"}),
        );
        let line = envelope.to_line().unwrap();

        // Exactly one newline: the terminator
        assert_eq!(line.bytes().filter(|&b| b == b'\n').count(), 1);
        assert!(line.ends_with('\n'));

        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(line.as_bytes());
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            Inbound::Envelope(e) => {
                assert_eq!(e.payload["prompt"], json!("line one\nline two"));
            }
            Inbound::Raw(raw) => panic!("expected envelope, got raw: {}", raw),
        }
    }

    #[test]
    fn test_partial_delivery_at_arbitrary_boundaries() {
        let envelope = sample_envelope();
        let line = envelope.to_line().unwrap();
        let bytes = line.as_bytes();

        // Split at every possible boundary, including mid-multibyte-free
        // positions at both ends
        for split in 1..bytes.len() {
            let mut buffer = LineBuffer::new();
            let mut parsed = buffer.push(&bytes[..split]);
            assert!(
                parsed.is_empty() || split == bytes.len(),
                "no complete line before the newline arrives"
            );
            parsed.extend(buffer.push(&bytes[split..]));

            assert_eq!(parsed.len(), 1, "split at {}", split);
            assert!(matches!(&parsed[0], Inbound::Envelope(e) if *e == envelope));
            assert_eq!(buffer.pending(), 0);
        }
    }

    #[test]
    fn test_three_way_split() {
        let envelope = sample_envelope();
        let line = envelope.to_line().unwrap();
        let bytes = line.as_bytes();

        let mut buffer = LineBuffer::new();
        let mut parsed = Vec::new();
        parsed.extend(buffer.push(&bytes[..5]));
        parsed.extend(buffer.push(&bytes[5..11]));
        parsed.extend(buffer.push(&bytes[11..]));

        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let a = Envelope::new("1", MessageKind::Event, json!({"n": 1}));
        let b = Envelope::new("2", MessageKind::Event, json!({"n": 2}));
        let chunk = format!("{}{}", a.to_line().unwrap(), b.to_line().unwrap());

        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(chunk.as_bytes());

        assert_eq!(parsed.len(), 2);
        assert!(matches!(&parsed[0], Inbound::Envelope(e) if e.id == "1"));
        assert!(matches!(&parsed[1], Inbound::Envelope(e) if e.id == "2"));
    }

    #[test]
    fn test_malformed_line_surfaces_as_raw() {
        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(b"not json at all\n");

        assert_eq!(parsed.len(), 1);
        assert!(matches!(&parsed[0], Inbound::Raw(raw) if raw == "not json at all"));
    }

    #[test]
    fn test_json_but_not_an_envelope_is_raw() {
        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(b"{\"progress\": 42}\n");

        assert_eq!(parsed.len(), 1);
        assert!(matches!(&parsed[0], Inbound::Raw(_)));
    }

    #[test]
    fn test_chunk_with_no_newline_stays_buffered() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"partial without termin").is_empty());
        assert_eq!(buffer.pending(), 22);

        let parsed = buffer.push(b"ator\n");
        assert_eq!(parsed.len(), 1);
        assert!(matches!(&parsed[0], Inbound::Raw(raw) if raw == "partial without terminator"));
    }

    #[test]
    fn test_crlf_terminated_lines() {
        let mut buffer = LineBuffer::new();
        let parsed = buffer.push(b"legacy output\r\n");

        assert_eq!(parsed.len(), 1);
        assert!(matches!(&parsed[0], Inbound::Raw(raw) if raw == "legacy output"));
    }

    #[test]
    fn test_error_envelope_requires_message() {
        let bad = Envelope::new("e-1", MessageKind::Error, json!({"reason": "nope"}));
        assert!(bad.validate().is_err());

        let good = Envelope::new("e-1", MessageKind::Error, json!({"message": "nope"}));
        assert!(good.validate().is_ok());
        assert_eq!(good.error_message(), Some("nope"));
    }

    #[test]
    fn test_empty_id_is_invalid() {
        let envelope = Envelope::new("", MessageKind::Event, json!(null));
        assert!(envelope.validate().is_err());
    }
}
