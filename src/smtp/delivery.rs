use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use super::server::Relay;
use crate::address::parse_domain;
use crate::error::RelayError;
use crate::verbose;

const SMTP_PORT: u16 = 25;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One SMTP reply, possibly multiline
#[derive(Debug)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_2xx(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Surface a downstream rejection with its code passed through
    fn into_error(self) -> RelayError {
        RelayError::Downstream { code: self.code, message: self.text() }
    }
}

/// Deliver one signed message to one resolved recipient
///
/// Exchanges are tried in ascending priority order; connection failures
/// fall through to the next exchange, while an SMTP rejection from a server
/// we reached is final and passes through to the inbound client.
pub async fn deliver(
    relay: &Relay,
    mail_from: &str,
    rcpt: &str,
    message: &[u8],
) -> Result<(), RelayError> {
    let domain = parse_domain(rcpt)?;
    let mxs = relay.dns.resolve_mx(&domain).await?;

    let mut failures = Vec::new();
    for mx in &mxs {
        verbose!("Delivering <{}> via {} (priority {})", rcpt, mx.exchange, mx.priority);
        match deliver_via(relay, &mx.exchange, mail_from, rcpt, message).await {
            Ok(()) => return Ok(()),
            Err(e @ RelayError::Downstream { .. }) => return Err(e),
            Err(e) => {
                verbose!("Exchange {} failed: {}", mx.exchange, e);
                failures.push(format!("{}: {}", mx.exchange, e));
            }
        }
    }
    Err(RelayError::DeliveryFailed(failures.join("; ")))
}

/// One delivery attempt against a single exchange
async fn deliver_via(
    relay: &Relay,
    exchange: &str,
    mail_from: &str,
    rcpt: &str,
    message: &[u8],
) -> Result<(), RelayError> {
    let stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((exchange, SMTP_PORT)),
    )
    .await
    .map_err(|_| RelayError::DeliveryFailed(format!("connect to {} timed out", exchange)))?
    .map_err(|e| RelayError::DeliveryFailed(format!("connect to {} failed: {}", exchange, e)))?;

    let mut reader = BufReader::new(stream);
    let ehlo_name = relay.config.ehlo_name();

    let greeting = read_reply(&mut reader).await?;
    if greeting.code != 220 {
        return Err(greeting.into_error());
    }

    write_line(&mut reader, &format!("EHLO {}", ehlo_name)).await?;
    let ehlo = read_reply(&mut reader).await?;
    if !ehlo.is_2xx() {
        return Err(ehlo.into_error());
    }

    // Opportunistic TLS: upgrade when the peer advertises it, continue in
    // cleartext otherwise
    let offers_starttls = ehlo
        .lines
        .iter()
        .any(|line| line.to_uppercase().starts_with("STARTTLS"));
    if offers_starttls {
        write_line(&mut reader, "STARTTLS").await?;
        let ready = read_reply(&mut reader).await?;
        if ready.code == 220 {
            let server_name = ServerName::try_from(exchange.to_string()).map_err(|e| {
                RelayError::DeliveryFailed(format!("invalid exchange name {}: {}", exchange, e))
            })?;
            let connector = TlsConnector::from(relay.client_tls.clone());
            let tls_stream = connector
                .connect(server_name, reader.into_inner())
                .await
                .map_err(|e| {
                    RelayError::DeliveryFailed(format!("TLS handshake with {} failed: {}", exchange, e))
                })?;
            verbose!("STARTTLS established with {}", exchange);

            let mut tls_reader = BufReader::new(tls_stream);
            write_line(&mut tls_reader, &format!("EHLO {}", ehlo_name)).await?;
            let ehlo = read_reply(&mut tls_reader).await?;
            if !ehlo.is_2xx() {
                return Err(ehlo.into_error());
            }
            return send_envelope(&mut tls_reader, mail_from, rcpt, message).await;
        }
        verbose!("{} refused STARTTLS ({}), continuing in cleartext", exchange, ready.code);
    }

    send_envelope(&mut reader, mail_from, rcpt, message).await
}

/// Submit the envelope and message over an established connection
async fn send_envelope<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    mail_from: &str,
    rcpt: &str,
    message: &[u8],
) -> Result<(), RelayError> {
    write_line(reader, &format!("MAIL FROM:<{}>", mail_from)).await?;
    let reply = read_reply(reader).await?;
    if !reply.is_2xx() {
        return Err(reply.into_error());
    }

    write_line(reader, &format!("RCPT TO:<{}>", rcpt)).await?;
    let reply = read_reply(reader).await?;
    if !reply.is_2xx() {
        return Err(reply.into_error());
    }

    write_line(reader, "DATA").await?;
    let reply = read_reply(reader).await?;
    if reply.code != 354 {
        return Err(reply.into_error());
    }

    write_message(reader, message).await?;
    let reply = read_reply(reader).await?;
    if !reply.is_2xx() {
        return Err(reply.into_error());
    }

    write_line(reader, "QUIT").await.ok();
    Ok(())
}

/// Write the message body with dot-stuffing and the final terminator
async fn write_message<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    message: &[u8],
) -> Result<(), RelayError> {
    let writer = reader.get_mut();
    for line in message.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read an SMTP reply (possibly multiline)
async fn read_reply<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
) -> Result<Reply, RelayError> {
    let mut lines = Vec::new();
    let mut code: u16 = 0;

    loop {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| RelayError::DeliveryFailed("reply timed out".to_string()))?
            .map_err(|e| RelayError::DeliveryFailed(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(RelayError::DeliveryFailed("connection closed".to_string()));
        }
        if line.len() < 4 {
            return Err(RelayError::DeliveryFailed(format!("invalid reply: {}", line.trim())));
        }

        let reply_code: u16 = line[..3]
            .parse()
            .map_err(|_| RelayError::DeliveryFailed(format!("invalid reply: {}", line.trim())))?;
        if code == 0 {
            code = reply_code;
        } else if code != reply_code {
            return Err(RelayError::DeliveryFailed(format!(
                "inconsistent reply codes: {} vs {}",
                code, reply_code
            )));
        }

        let separator = line.chars().nth(3).unwrap_or(' ');
        lines.push(line[4..].trim_end().to_string());

        // Space separator means last line
        if separator == ' ' {
            break;
        }
    }

    Ok(Reply { code, lines })
}

async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
    line: &str,
) -> Result<(), RelayError> {
    let writer = reader.get_mut();
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}
