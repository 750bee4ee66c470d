use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use futures_util::future::join_all;

use super::command::{parse_command, SmtpCommand};
use super::delivery;
use super::response::SmtpResponse;
use super::server::Relay;
use crate::address::{is_fqdn, parse_domain};
use crate::dns::MxRecord;
use crate::error::RelayError;
use crate::forward::resolve_forward;
use crate::message::DataSink;
use crate::{log_error, verbose};

/// SMTP session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Initial state, waiting for client to send HELO/EHLO
    Connected,
    /// Client has identified itself with a valid FQDN
    Greeted,
    /// MAIL FROM has been accepted
    MailFrom,
    /// At least one RCPT TO has been accepted
    RcptTo,
    /// Receiving DATA
    Data,
    /// Session is closing
    Closing,
}

/// One accepted recipient: the address as received and where it forwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub original: String,
    pub forward: String,
}

/// Per-session envelope; lives and dies with the connection
#[derive(Debug, Clone)]
pub struct Envelope {
    pub client_ip: IpAddr,
    /// HELO/EHLO hostname
    pub helo: String,
    pub mail_from: String,
    pub recipients: Vec<ResolvedRecipient>,
}

impl Envelope {
    fn new(client_ip: IpAddr) -> Self {
        Self { client_ip, helo: String::new(), mail_from: String::new(), recipients: Vec::new() }
    }

    fn reset(&mut self) {
        self.mail_from.clear();
        self.recipients.clear();
    }
}

/// Result of processing one line of input
pub struct SmtpResult {
    /// Response data to send back (may be empty mid-DATA)
    pub response: Vec<u8>,
    /// Whether the connection should close
    pub should_close: bool,
    /// Whether to start the TLS handshake
    pub start_tls: bool,
}

impl SmtpResult {
    fn new(response: Vec<u8>) -> Self {
        Self { response, should_close: false, start_tls: false }
    }

    fn none() -> Self {
        Self::new(Vec::new())
    }

    fn reply(response: SmtpResponse) -> Self {
        Self::new(response.to_bytes())
    }

    fn error(error: &RelayError) -> Self {
        Self::reply(SmtpResponse::from_error(error))
    }

    fn with_close(mut self) -> Self {
        self.should_close = true;
        self
    }

    fn with_start_tls(mut self) -> Self {
        self.start_tls = true;
        self
    }
}

/// SMTP session for a single inbound connection
///
/// Strictly sequential: every handler completes (including DNS, rate limit,
/// verification and fan-out delivery) before the next line is processed.
pub struct SmtpSession {
    relay: Arc<Relay>,
    pub state: SmtpState,
    pub envelope: Envelope,
    sink: Option<DataSink>,
    tls_enabled: bool,
    tls_available: bool,
}

impl SmtpSession {
    pub fn new(relay: Arc<Relay>, client_ip: IpAddr, tls_enabled: bool) -> Self {
        let tls_available = relay.acceptor.is_some();
        Self {
            relay,
            state: SmtpState::Connected,
            envelope: Envelope::new(client_ip),
            sink: None,
            tls_enabled,
            tls_available,
        }
    }

    /// Initial 220 greeting
    pub fn greeting(&self) -> Vec<u8> {
        SmtpResponse::service_ready(self.relay.config.ehlo_name()).to_bytes()
    }

    /// The name this relay answers as
    pub fn hostname(&self) -> &str {
        self.relay.config.ehlo_name()
    }

    /// Called after an inbound STARTTLS handshake completes
    ///
    /// The client must re-EHLO; any transaction state is discarded.
    pub fn tls_started(&mut self) {
        self.tls_enabled = true;
        self.state = SmtpState::Connected;
        self.envelope.helo.clear();
        self.envelope.reset();
        self.sink = None;
    }

    /// Process one input line (without its CRLF terminator)
    pub async fn handle_line(&mut self, line: &[u8]) -> SmtpResult {
        if self.state == SmtpState::Data {
            return self.handle_data_line(line).await;
        }

        match parse_command(&String::from_utf8_lossy(line)) {
            SmtpCommand::Helo(domain) => self.handle_helo(domain, false),
            SmtpCommand::Ehlo(domain) => self.handle_helo(domain, true),
            SmtpCommand::MailFrom { address, .. } => self.handle_mail(address).await,
            SmtpCommand::RcptTo { address, .. } => self.handle_rcpt(address).await,
            SmtpCommand::Data => self.handle_data(),
            SmtpCommand::Rset => self.handle_rset(),
            SmtpCommand::StartTls => self.handle_starttls(),
            // Unauthenticated relay by design; AUTH is never advertised
            SmtpCommand::Auth => SmtpResult::reply(SmtpResponse::not_implemented()),
            SmtpCommand::Vrfy(_) => SmtpResult::reply(SmtpResponse::vrfy_unverified()),
            SmtpCommand::Expn(_) => SmtpResult::reply(SmtpResponse::not_implemented()),
            SmtpCommand::Help => SmtpResult::new(SmtpResponse::help()),
            SmtpCommand::Noop => SmtpResult::reply(SmtpResponse::ok("OK")),
            SmtpCommand::Quit => self.handle_quit(),
            SmtpCommand::Unknown(_) => SmtpResult::reply(SmtpResponse::syntax_error()),
        }
    }

    fn handle_helo(&mut self, domain: String, is_esmtp: bool) -> SmtpResult {
        if !is_fqdn(&domain) {
            return SmtpResult::error(&RelayError::BadClientHostname(domain));
        }
        self.envelope.helo = domain.to_lowercase();
        self.envelope.reset();
        self.state = SmtpState::Greeted;

        if is_esmtp {
            SmtpResult::new(self.build_ehlo_response())
        } else {
            SmtpResult::reply(SmtpResponse::ok(format!(
                "{} Hello {}",
                self.relay.config.ehlo_name(),
                self.envelope.helo
            )))
        }
    }

    fn build_ehlo_response(&self) -> Vec<u8> {
        let mut lines = vec![
            format!("{} Hello {}", self.relay.config.ehlo_name(), self.envelope.helo),
            format!("SIZE {}", self.relay.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
        ];
        if self.tls_available && !self.tls_enabled {
            lines.push("STARTTLS".to_string());
        }
        SmtpResponse::multiline(250, &lines)
    }

    async fn handle_mail(&mut self, address: String) -> SmtpResult {
        if self.state == SmtpState::Connected {
            return SmtpResult::reply(SmtpResponse::bad_sequence());
        }

        if let Err(e) = self.check_sender(&address).await {
            verbose!("MAIL FROM <{}> rejected: {}", address, e);
            return SmtpResult::error(&e);
        }

        self.envelope.reset();
        self.envelope.mail_from = address.to_lowercase();
        self.state = SmtpState::MailFrom;
        SmtpResult::reply(SmtpResponse::ok(format!("OK <{}>", address)))
    }

    /// MAIL FROM gate: per-sender quota, then sender domain sanity
    async fn check_sender(&self, address: &str) -> Result<(), RelayError> {
        let key = if address.is_empty() { "<>" } else { address };
        self.relay.limiter.check(key)?;

        // The null sender (bounces) carries no domain to validate
        if address.is_empty() {
            return Ok(());
        }
        let domain = parse_domain(address)?;
        self.relay.dns.resolve_mx(&domain).await?;
        Ok(())
    }

    async fn handle_rcpt(&mut self, address: String) -> SmtpResult {
        if self.state != SmtpState::MailFrom && self.state != SmtpState::RcptTo {
            return SmtpResult::reply(SmtpResponse::bad_sequence());
        }

        let recipient = match self.check_recipient(&address).await {
            Ok(recipient) => recipient,
            Err(e) => {
                verbose!("RCPT TO <{}> rejected: {}", address, e);
                return SmtpResult::error(&e);
            }
        };

        verbose!("RCPT TO <{}> forwards to <{}>", recipient.original, recipient.forward);
        self.envelope.recipients.push(recipient);
        self.state = SmtpState::RcptTo;
        SmtpResult::reply(SmtpResponse::ok(format!("OK <{}>", address)))
    }

    /// RCPT TO gate: our exchanges must serve the domain, and the domain's
    /// TXT record must name a forwarding target
    async fn check_recipient(&self, address: &str) -> Result<ResolvedRecipient, RelayError> {
        let domain = parse_domain(address)?;
        let mxs = self.relay.dns.resolve_mx(&domain).await?;
        verify_exchanges(&mxs, &self.relay.config.exchanges)?;
        let forward = resolve_forward(&self.relay.dns, address).await?;
        Ok(ResolvedRecipient { original: address.to_lowercase(), forward })
    }

    fn handle_data(&mut self) -> SmtpResult {
        if self.state != SmtpState::RcptTo {
            return SmtpResult::reply(SmtpResponse::bad_sequence());
        }
        self.sink = Some(DataSink::new(self.relay.config.max_message_size));
        self.state = SmtpState::Data;
        SmtpResult::reply(SmtpResponse::start_mail_input())
    }

    async fn handle_data_line(&mut self, line: &[u8]) -> SmtpResult {
        if line != b"." {
            if let Some(sink) = self.sink.as_mut() {
                sink.push_line(line);
            }
            return SmtpResult::none();
        }

        // End of data: authenticate, re-sign, fan out, aggregate
        let result = self.finish_data().await;
        self.sink = None;
        self.envelope.reset();
        self.state = SmtpState::Greeted;
        match result {
            Ok(response) => SmtpResult::reply(response),
            Err(e) => {
                log_error!("DATA rejected: {}", e);
                SmtpResult::error(&e)
            }
        }
    }

    async fn finish_data(&mut self) -> Result<SmtpResponse, RelayError> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| RelayError::Internal("data stream missing".to_string()))?;
        let message = sink.finish()?;

        // A message whose originals forward to one target is delivered once
        let targets = dedup_targets(&self.envelope.recipients);

        let spf_ok = self
            .relay
            .auth
            .verify_spf(
                self.envelope.client_ip,
                &self.envelope.mail_from,
                &self.envelope.helo,
                self.relay.config.ehlo_name(),
            )
            .await?;
        let dkim_ok = self.relay.auth.verify_dkim(&message.raw).await?;
        if !spf_ok && !dkim_ok {
            return Err(RelayError::ProvenanceFailed);
        }
        verbose!("Provenance: spf={} dkim={}", spf_ok, dkim_ok);

        let signing_domain = self
            .relay
            .config
            .dkim
            .domain
            .clone()
            .unwrap_or_else(|| self.relay.config.ehlo_name().to_string());
        let outbound = message.to_outbound(&signing_domain)?;
        let signed = match self.relay.dkim.as_ref() {
            Some(keypair) => keypair
                .sign(&outbound, &self.relay.config.dkim.selector, &signing_domain)
                .map_err(|e| RelayError::Internal(format!("DKIM signing failed: {}", e)))?,
            None => {
                log_error!("Warning: no DKIM key configured, relaying unsigned");
                outbound
            }
        };

        let mail_from = self.envelope.mail_from.clone();
        let deliveries = targets
            .iter()
            .map(|target| delivery::deliver(&self.relay, &mail_from, target, &signed));
        let results = join_all(deliveries).await;
        aggregate_outcomes(results)?;

        Ok(SmtpResponse::ok(format!(
            "OK message relayed to {} recipient{}",
            targets.len(),
            if targets.len() == 1 { "" } else { "s" }
        )))
    }

    fn handle_rset(&mut self) -> SmtpResult {
        self.envelope.reset();
        self.sink = None;
        if self.state != SmtpState::Connected {
            self.state = SmtpState::Greeted;
        }
        SmtpResult::reply(SmtpResponse::ok("OK"))
    }

    fn handle_starttls(&mut self) -> SmtpResult {
        if self.state != SmtpState::Greeted {
            return SmtpResult::reply(SmtpResponse::bad_sequence());
        }
        if self.tls_enabled {
            return SmtpResult::reply(SmtpResponse::new(503, "TLS already active"));
        }
        if !self.tls_available {
            return SmtpResult::reply(SmtpResponse::not_implemented());
        }
        SmtpResult::reply(SmtpResponse::new(220, "Ready to start TLS")).with_start_tls()
    }

    fn handle_quit(&mut self) -> SmtpResult {
        self.state = SmtpState::Closing;
        SmtpResult::reply(SmtpResponse::service_closing(self.relay.config.ehlo_name()))
            .with_close()
    }
}

/// Deduplicate resolved forwarding addresses, preserving first-seen order
pub fn dedup_targets(recipients: &[ResolvedRecipient]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for recipient in recipients {
        let key = recipient.forward.to_lowercase();
        if seen.insert(key.clone()) {
            targets.push(key);
        }
    }
    targets
}

/// Require every one of our configured exchanges in the recipient's MX set
pub fn verify_exchanges(mxs: &[MxRecord], required: &[String]) -> Result<(), RelayError> {
    let present: HashSet<&str> = mxs.iter().map(|mx| mx.exchange.as_str()).collect();
    let missing: Vec<String> = required
        .iter()
        .map(|r| r.trim_end_matches('.').to_lowercase())
        .filter(|r| !present.contains(r.as_str()))
        .collect();
    if !missing.is_empty() {
        return Err(RelayError::InvalidMx(format!(
            "Missing required DNS MX records: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Collapse fan-out delivery results into one reply
///
/// All successes reply 250; otherwise the first permanent (5xx) failure
/// wins over any transient one.
pub fn aggregate_outcomes(results: Vec<Result<(), RelayError>>) -> Result<(), RelayError> {
    let mut first_transient = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                if first_transient.is_none() {
                    first_transient = Some(e);
                }
            }
        }
    }
    match first_transient {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn new_session() -> SmtpSession {
        let relay = Relay::new(RelayConfig::for_tests(), None, None).unwrap();
        SmtpSession::new(Arc::new(relay), "198.51.100.7".parse().unwrap(), false)
    }

    fn text(result: &SmtpResult) -> String {
        String::from_utf8_lossy(&result.response).into_owned()
    }

    #[tokio::test]
    async fn test_greeting() {
        let session = new_session();
        let greeting = String::from_utf8_lossy(&session.greeting()).into_owned();
        assert!(greeting.starts_with("220 "), "{}", greeting);
        assert!(greeting.contains("mx1.forwardemail.net"), "{}", greeting);
    }

    #[tokio::test]
    async fn test_ehlo() {
        let mut session = new_session();
        let result = session.handle_line(b"EHLO client.example.com").await;

        assert!(!result.should_close);
        assert_eq!(session.state, SmtpState::Greeted);
        assert_eq!(session.envelope.helo, "client.example.com");

        let reply = text(&result);
        assert!(reply.starts_with("250-"), "{}", reply);
        assert!(reply.contains("SIZE 26214400"), "{}", reply);
        assert!(reply.contains("PIPELINING"), "{}", reply);
        // Unauthenticated relay: AUTH never advertised, and no STARTTLS
        // without loaded TLS material
        assert!(!reply.contains("AUTH"), "{}", reply);
        assert!(!reply.contains("STARTTLS"), "{}", reply);
    }

    #[tokio::test]
    async fn test_helo_rejects_non_fqdn() {
        let mut session = new_session();
        let result = session.handle_line(b"HELO localhost").await;
        assert!(text(&result).starts_with("550"));
        assert_eq!(session.state, SmtpState::Connected);
    }

    #[tokio::test]
    async fn test_bad_sequence() {
        let mut session = new_session();

        // MAIL FROM before any greeting verb
        let result = session.handle_line(b"MAIL FROM:<sender@example.com>").await;
        assert!(text(&result).starts_with("503"));

        // DATA without an accepted recipient
        session.handle_line(b"EHLO client.example.com").await;
        let result = session.handle_line(b"DATA").await;
        assert!(text(&result).starts_with("503"));
        assert_eq!(session.state, SmtpState::Greeted);
    }

    #[tokio::test]
    async fn test_null_sender_accepted() {
        let mut session = new_session();
        session.handle_line(b"EHLO client.example.com").await;

        let result = session.handle_line(b"MAIL FROM:<>").await;
        assert!(text(&result).starts_with("250"), "{}", text(&result));
        assert_eq!(session.state, SmtpState::MailFrom);
        assert!(session.envelope.mail_from.is_empty());
    }

    #[tokio::test]
    async fn test_rset_returns_to_greeted() {
        let mut session = new_session();
        session.handle_line(b"EHLO client.example.com").await;
        session.handle_line(b"MAIL FROM:<>").await;

        let result = session.handle_line(b"RSET").await;
        assert!(text(&result).starts_with("250"));
        assert_eq!(session.state, SmtpState::Greeted);
        assert!(session.envelope.mail_from.is_empty());
        assert!(session.envelope.recipients.is_empty());
    }

    #[tokio::test]
    async fn test_auth_is_disabled() {
        let mut session = new_session();
        session.handle_line(b"EHLO client.example.com").await;
        let result = session.handle_line(b"AUTH PLAIN dGVzdA==").await;
        assert!(text(&result).starts_with("502"));
    }

    #[tokio::test]
    async fn test_starttls_without_material() {
        let mut session = new_session();
        session.handle_line(b"EHLO client.example.com").await;
        let result = session.handle_line(b"STARTTLS").await;
        assert!(text(&result).starts_with("502"));
        assert!(!result.start_tls);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut session = new_session();
        let result = session.handle_line(b"FROBNICATE now").await;
        assert!(text(&result).starts_with("500"));
    }

    #[tokio::test]
    async fn test_quit() {
        let mut session = new_session();
        let result = session.handle_line(b"QUIT").await;
        assert!(result.should_close);
        assert!(text(&result).starts_with("221"));
        assert_eq!(session.state, SmtpState::Closing);
    }

    fn recipient(original: &str, forward: &str) -> ResolvedRecipient {
        ResolvedRecipient { original: original.to_string(), forward: forward.to_string() }
    }

    fn mx(exchange: &str, priority: u16) -> MxRecord {
        MxRecord { exchange: exchange.to_string(), priority }
    }

    #[test]
    fn test_dedup_targets() {
        let recipients = vec![
            recipient("a@example.com", "user@gmail.com"),
            recipient("b@example.com", "USER@gmail.com"),
            recipient("c@example.com", "other@gmail.com"),
        ];
        assert_eq!(dedup_targets(&recipients), vec!["user@gmail.com", "other@gmail.com"]);
    }

    #[test]
    fn test_verify_exchanges_all_present() {
        let mxs = vec![mx("mx1.forwardemail.net", 10), mx("mx2.forwardemail.net", 20)];
        let required =
            vec!["MX1.forwardemail.net.".to_string(), "mx2.forwardemail.net".to_string()];
        assert!(verify_exchanges(&mxs, &required).is_ok());
    }

    #[test]
    fn test_verify_exchanges_missing() {
        let mxs = vec![mx("mx1.forwardemail.net", 10)];
        let required =
            vec!["mx1.forwardemail.net".to_string(), "mx2.forwardemail.net".to_string()];
        let err = verify_exchanges(&mxs, &required).unwrap_err();
        assert_eq!(err.smtp_code(), 550);
        let msg = err.to_string();
        assert!(msg.contains("Missing required DNS MX records"), "{}", msg);
        assert!(msg.contains("mx2.forwardemail.net"), "{}", msg);
        assert!(!msg.contains("mx1"), "{}", msg);
    }

    #[test]
    fn test_aggregate_all_ok() {
        assert!(aggregate_outcomes(vec![Ok(()), Ok(())]).is_ok());
        assert!(aggregate_outcomes(Vec::new()).is_ok());
    }

    #[test]
    fn test_aggregate_permanent_wins_over_transient() {
        let results = vec![
            Ok(()),
            Err(RelayError::DeliveryFailed("timeout".to_string())),
            Err(RelayError::Downstream { code: 550, message: "no such user".to_string() }),
        ];
        let err = aggregate_outcomes(results).unwrap_err();
        assert_eq!(err.smtp_code(), 550);
    }

    #[test]
    fn test_aggregate_first_transient_when_no_permanent() {
        let results = vec![
            Err(RelayError::DeliveryFailed("first".to_string())),
            Err(RelayError::Downstream { code: 452, message: "second".to_string() }),
        ];
        let err = aggregate_outcomes(results).unwrap_err();
        assert!(err.to_string().contains("first"));
    }
}
