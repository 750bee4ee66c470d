use mail_parser::{MessageParser, MimeHeaders};

use crate::error::RelayError;

/// Headers removed before re-transmission
///
/// Duplicate signatures and upstream routing metadata must not survive the
/// hop; MIME-Version and Content-Type are regenerated by the builder.
pub const STRIPPED_HEADERS: [&str; 8] = [
    "mime-version",
    "content-type",
    "dkim-signature",
    "x-google-dkim-signature",
    "x-gm-message-state",
    "x-google-smtp-source",
    "x-received",
    "message-id",
];

pub fn is_stripped_header(name: &str) -> bool {
    let name = name.to_lowercase();
    STRIPPED_HEADERS.iter().any(|h| *h == name)
}

/// Streaming consumer for the DATA phase
///
/// Fed one line at a time as it arrives off the socket: removes dot
/// stuffing, enforces the size cap incrementally, and captures the header
/// block before the body has finished arriving. Once the cap is crossed the
/// sink keeps consuming (the client must see the terminator) but stops
/// buffering.
pub struct DataSink {
    limit: usize,
    size: usize,
    raw: Vec<u8>,
    headers: Vec<(String, String)>,
    in_headers: bool,
}

impl DataSink {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            size: 0,
            raw: Vec::new(),
            headers: Vec::new(),
            in_headers: true,
        }
    }

    /// Consume one line, without its CRLF terminator
    pub fn push_line(&mut self, line: &[u8]) {
        // Dot unstuffing (RFC 5321 section 4.5.2)
        let line = if line.first() == Some(&b'.') { &line[1..] } else { line };

        self.size += line.len() + 2;
        if self.size > self.limit {
            return;
        }
        self.raw.extend_from_slice(line);
        self.raw.extend_from_slice(b"\r\n");

        if self.in_headers {
            self.capture_header_line(line);
        }
    }

    fn capture_header_line(&mut self, line: &[u8]) {
        if line.is_empty() {
            self.in_headers = false;
            return;
        }
        let text = String::from_utf8_lossy(line);
        if text.starts_with(' ') || text.starts_with('\t') {
            // Folded continuation of the previous header
            if let Some((_, value)) = self.headers.last_mut() {
                value.push(' ');
                value.push_str(text.trim());
            }
            return;
        }
        if let Some((name, value)) = text.split_once(':') {
            self.headers
                .push((name.trim().to_string(), value.trim_start().to_string()));
        }
    }

    /// Headers captured so far; complete once the blank separator arrived
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn headers_complete(&self) -> bool {
        !self.in_headers
    }

    /// Total on-wire size consumed so far
    pub fn size(&self) -> usize {
        self.size
    }

    /// Finish the stream, failing if the size cap was exceeded
    pub fn finish(self) -> Result<ParsedMessage, RelayError> {
        if self.size > self.limit {
            return Err(RelayError::MessageTooLarge { size: self.size, limit: self.limit });
        }
        Ok(ParsedMessage::parse(self.raw, self.headers))
    }
}

/// One fully buffered attachment
#[derive(Debug, Clone)]
pub struct Attachment {
    pub content_type: String,
    pub filename: Option<String>,
    pub disposition: Option<String>,
    pub contents: Vec<u8>,
}

/// A parsed inbound message
///
/// Common headers are promoted into typed fields; every header is also kept
/// verbatim (in order) for re-serialization.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub raw: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reply_to: Option<String>,
    pub references: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl ParsedMessage {
    fn parse(raw: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        let mut message = Self {
            subject: header_value(&headers, "subject"),
            from: header_value(&headers, "from"),
            to: header_value(&headers, "to"),
            cc: header_value(&headers, "cc"),
            bcc: header_value(&headers, "bcc"),
            date: header_value(&headers, "date"),
            message_id: header_value(&headers, "message-id"),
            in_reply_to: header_value(&headers, "in-reply-to"),
            reply_to: header_value(&headers, "reply-to"),
            references: header_value(&headers, "references"),
            ..Self::default()
        };

        if let Some(parsed) = MessageParser::new().parse(&raw) {
            message.text = parsed.body_text(0).map(|t| t.into_owned());
            message.html = parsed.body_html(0).map(|t| t.into_owned());
            for part in parsed.attachments() {
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                message.attachments.push(Attachment {
                    content_type,
                    filename: part.attachment_name().map(|n| n.to_string()),
                    disposition: part.content_disposition().map(|d| d.ctype().to_string()),
                    contents: part.contents().to_vec(),
                });
            }
        }

        message.raw = raw;
        message.headers = headers;
        message
    }

    /// Case-insensitive header lookup on the verbatim set
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| n.to_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Re-serialize for outbound delivery
    ///
    /// Every verbatim header except the stripped set is carried over; the
    /// builder reconstructs MIME-Version and Content-Type around the body
    /// parts, and a fresh Message-ID replaces the original.
    pub fn to_outbound(&self, our_domain: &str) -> Result<Vec<u8>, RelayError> {
        use mail_builder::headers::HeaderType;
        use mail_builder::MessageBuilder;

        let mut builder = MessageBuilder::new();
        for (name, value) in &self.headers {
            if is_stripped_header(name) {
                continue;
            }
            builder = builder.header(name.as_str(), HeaderType::Text(value.as_str().into()));
        }
        builder = builder.header(
            "Message-ID",
            HeaderType::Text(new_message_id(our_domain).into()),
        );

        if let Some(ref text) = self.text {
            builder = builder.text_body(text.as_str());
        }
        if let Some(ref html) = self.html {
            builder = builder.html_body(html.as_str());
        }
        for attachment in &self.attachments {
            builder = builder.attachment(
                attachment.content_type.as_str(),
                attachment.filename.as_deref().unwrap_or("attachment"),
                attachment.contents.as_slice(),
            );
        }

        builder
            .write_to_vec()
            .map_err(|e| RelayError::Internal(format!("message serialization failed: {}", e)))
    }
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Globally unique Message-ID under our own domain
fn new_message_id(domain: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let micros = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_micros();
    format!(
        "<{:x}.{:x}.{:x}@{}>",
        micros,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(sink: &mut DataSink, lines: &[&str]) {
        for line in lines {
            sink.push_line(line.as_bytes());
        }
    }

    fn sample_sink() -> DataSink {
        let mut sink = DataSink::new(1024 * 1024);
        feed(
            &mut sink,
            &[
                "From: Sender <sender@example.com>",
                "To: hello@example.org",
                "Subject: A test",
                " split over two lines",
                "Message-ID: <orig@example.com>",
                "MIME-Version: 1.0",
                "Content-Type: text/plain; charset=utf-8",
                "DKIM-Signature: v=1; a=rsa-sha256; d=example.com; b=abc",
                "X-Received: by 10.0.0.1",
                "",
                "Hello world",
                ".. a line that was dot-stuffed",
            ],
        );
        sink
    }

    #[test]
    fn test_headers_available_before_end_of_data() {
        let mut sink = DataSink::new(1024);
        feed(&mut sink, &["Subject: early", ""]);
        assert!(sink.headers_complete());
        assert_eq!(sink.headers()[0], ("Subject".to_string(), "early".to_string()));
        // Body still arriving
        sink.push_line(b"more body");
    }

    #[test]
    fn test_folded_header_unfolded() {
        let message = sample_sink().finish().unwrap();
        assert_eq!(message.subject.as_deref(), Some("A test split over two lines"));
    }

    #[test]
    fn test_dot_unstuffing() {
        let message = sample_sink().finish().unwrap();
        let raw = String::from_utf8_lossy(&message.raw);
        assert!(raw.contains("\r\n. a line that was dot-stuffed"));
        assert!(!raw.contains(".."));
    }

    #[test]
    fn test_size_cap_enforced_at_finish() {
        let mut sink = DataSink::new(64);
        feed(&mut sink, &["Subject: x", ""]);
        for _ in 0..10 {
            sink.push_line(b"0123456789abcdef");
        }
        let err = sink.finish().unwrap_err();
        assert_eq!(err.smtp_code(), 450);
    }

    #[test]
    fn test_oversized_sink_stops_buffering() {
        let mut sink = DataSink::new(32);
        for _ in 0..1000 {
            sink.push_line(b"0123456789abcdef");
        }
        assert!(sink.raw.len() <= 64);
    }

    #[test]
    fn test_promoted_fields() {
        let message = sample_sink().finish().unwrap();
        assert_eq!(message.from.as_deref(), Some("Sender <sender@example.com>"));
        assert_eq!(message.to.as_deref(), Some("hello@example.org"));
        assert_eq!(message.message_id.as_deref(), Some("<orig@example.com>"));
        let text = message.text.as_deref().unwrap();
        assert!(text.contains("Hello world"));
        assert!(text.contains(". a line that was dot-stuffed"));
    }

    #[test]
    fn test_outbound_strips_headers() {
        let message = sample_sink().finish().unwrap();
        let outbound = message.to_outbound("relay.example.net").unwrap();
        let text = String::from_utf8_lossy(&outbound);
        let lowered = text.to_lowercase();

        assert!(!lowered.contains("dkim-signature"));
        assert!(!lowered.contains("x-received"));
        assert!(!text.contains("<orig@example.com>"));
        // Regenerated by the builder
        assert!(lowered.contains("message-id"));
        assert!(text.contains("@relay.example.net>"));
        assert!(text.contains("Subject: A test split over two lines"));
        assert!(text.contains("Hello world"));
    }

    #[test]
    fn test_outbound_keeps_attachments() {
        let mut sink = DataSink::new(1024 * 1024);
        feed(
            &mut sink,
            &[
                "From: a@example.com",
                "Subject: with attachment",
                "MIME-Version: 1.0",
                "Content-Type: multipart/mixed; boundary=\"xyz\"",
                "",
                "--xyz",
                "Content-Type: text/plain",
                "",
                "see attached",
                "--xyz",
                "Content-Type: application/pdf; name=\"doc.pdf\"",
                "Content-Disposition: attachment; filename=\"doc.pdf\"",
                "Content-Transfer-Encoding: base64",
                "",
                "JVBERi0xLjQ=",
                "--xyz--",
            ],
        );
        let message = sink.finish().unwrap();
        assert_eq!(message.attachments.len(), 1);
        let attachment = &message.attachments[0];
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.filename.as_deref(), Some("doc.pdf"));
        assert_eq!(attachment.contents, b"%PDF-1.4");

        let outbound = message.to_outbound("relay.example.net").unwrap();
        let text = String::from_utf8_lossy(&outbound);
        assert!(text.contains("doc.pdf"));
        assert!(text.contains("see attached"));
    }

    #[test]
    fn test_stripped_header_set() {
        assert!(is_stripped_header("Content-Type"));
        assert!(is_stripped_header("DKIM-Signature"));
        assert!(is_stripped_header("X-Google-Smtp-Source"));
        assert!(!is_stripped_header("Subject"));
        assert!(!is_stripped_header("Date"));
    }
}
