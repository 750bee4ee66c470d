use crate::error::RelayError;

/// SMTP response codes and messages according to RFC 5321
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Translate a relay error into its wire reply
    ///
    /// This is the single point where typed errors become SMTP codes.
    pub fn from_error(error: &RelayError) -> Self {
        Self::new(error.smtp_code(), error.to_string())
    }

    /// Format response for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }

    /// Format a multiline response (for EHLO)
    pub fn multiline(code: u16, lines: &[String]) -> Vec<u8> {
        let mut result = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i == lines.len() - 1 {
                result.push_str(&format!("{} {}\r\n", code, line));
            } else {
                result.push_str(&format!("{}-{}\r\n", code, line));
            }
        }
        result.into_bytes()
    }

    // === Standard SMTP responses ===

    /// 220 - Service ready
    pub fn service_ready(domain: &str) -> Self {
        Self::new(220, format!("{} ESMTP Service Ready", domain))
    }

    /// 221 - Service closing
    pub fn service_closing(domain: &str) -> Self {
        Self::new(221, format!("{} Service closing transmission channel", domain))
    }

    /// 250 - Requested action okay
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(250, message)
    }

    /// 252 - Cannot VRFY, but will attempt delivery
    pub fn vrfy_unverified() -> Self {
        Self::new(252, "Cannot VRFY user, but will accept message and attempt delivery")
    }

    /// 354 - Start mail input
    pub fn start_mail_input() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    /// 421 - Service not available
    pub fn service_unavailable(domain: &str) -> Self {
        Self::new(421, format!("{} Service not available, closing transmission channel", domain))
    }

    /// 500 - Syntax error, command unrecognized
    pub fn syntax_error() -> Self {
        Self::new(500, "Syntax error, command unrecognized")
    }

    /// 502 - Command not implemented
    pub fn not_implemented() -> Self {
        Self::new(502, "Command not implemented")
    }

    /// 503 - Bad sequence of commands
    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    /// 214 - Help text
    pub fn help() -> Vec<u8> {
        Self::multiline(
            214,
            &[
                "Commands supported:".to_string(),
                "HELO EHLO MAIL RCPT DATA".to_string(),
                "RSET NOOP QUIT HELP VRFY STARTTLS".to_string(),
                "End of HELP info".to_string(),
            ],
        )
    }
}
