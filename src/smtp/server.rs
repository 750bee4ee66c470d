use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::response::SmtpResponse;
use super::session::SmtpSession;
use crate::auth::Authenticator;
use crate::config::RelayConfig;
use crate::dkim::DkimKeyPair;
use crate::dns::DnsFacade;
use crate::error::RelayError;
use crate::limiter::RateLimiter;
use crate::{log_error, log_info, verbose};

/// Inbound sessions are dropped after this long without a command
const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest accepted line, command or DATA (RFC 5321 allows far less)
const MAX_LINE: usize = 1024 * 1024;

/// Shared relay state, immutable after startup
pub struct Relay {
    pub config: RelayConfig,
    pub dns: DnsFacade,
    pub auth: Authenticator,
    pub limiter: RateLimiter,
    pub dkim: Option<Arc<DkimKeyPair>>,
    pub acceptor: Option<TlsAcceptor>,
    pub client_tls: Arc<tokio_rustls::rustls::ClientConfig>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        dkim: Option<DkimKeyPair>,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<Self, RelayError> {
        let dns = DnsFacade::new()?;
        let auth = Authenticator::new()?;
        let limiter = RateLimiter::new(config.rate_limit.max, config.rate_limit.window());
        let client_tls = crate::tls::client_config(config.danger_accept_invalid_certs);
        Ok(Self {
            config,
            dns,
            auth,
            limiter,
            dkim: dkim.map(Arc::new),
            acceptor,
            client_tls,
        })
    }
}

/// Bind the listen port and serve inbound SMTP sessions forever
pub async fn serve(relay: Arc<Relay>) -> Result<(), RelayError> {
    let addr = format!("0.0.0.0:{}", relay.config.port);
    let listener = TcpListener::bind(&addr).await?;
    log_info!("SMTP relay listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            verbose!("Connection from {}", peer);
            if let Err(e) = handle_connection(relay, socket, peer).await {
                verbose!("Session with {} ended: {}", peer, e);
            }
        });
    }
}

/// Outcome of one read loop over a particular stream
enum SessionEnd<S> {
    Closed,
    /// Client asked for STARTTLS; hand the raw stream back for the handshake
    StartTls(S),
}

async fn handle_connection(
    relay: Arc<Relay>,
    socket: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    let mut session = SmtpSession::new(relay.clone(), peer.ip(), relay.config.secure);

    // Implicit TLS: handshake before the greeting
    if relay.config.secure {
        let acceptor = match relay.acceptor.clone() {
            Some(acceptor) => acceptor,
            None => {
                log_error!("SECURE is set but no TLS material is loaded");
                return Ok(());
            }
        };
        let tls_stream = acceptor.accept(socket).await?;
        session.tls_started();
        run_session(&mut session, tls_stream, true).await?;
        return Ok(());
    }

    match run_session(&mut session, socket, true).await? {
        SessionEnd::Closed => Ok(()),
        SessionEnd::StartTls(socket) => {
            let acceptor = match relay.acceptor.clone() {
                // The session only offers STARTTLS when material is loaded
                Some(acceptor) => acceptor,
                None => return Ok(()),
            };
            let tls_stream = acceptor.accept(socket).await?;
            verbose!("STARTTLS established with {}", peer);
            session.tls_started();
            run_session(&mut session, tls_stream, false).await?;
            Ok(())
        }
    }
}

/// Drive the session over one stream until it closes or upgrades to TLS
async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    session: &mut SmtpSession,
    stream: S,
    send_greeting: bool,
) -> std::io::Result<SessionEnd<S>> {
    let mut reader = BufReader::new(stream);

    if send_greeting {
        let greeting = session.greeting();
        reader.get_mut().write_all(&greeting).await?;
    }

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = match tokio::time::timeout(
            SESSION_READ_TIMEOUT,
            (&mut reader).take(MAX_LINE as u64).read_until(b'\n', &mut line),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                let goodbye = SmtpResponse::service_unavailable(session.hostname()).to_bytes();
                let _ = reader.get_mut().write_all(&goodbye).await;
                return Ok(SessionEnd::Closed);
            }
        };
        // Client disconnected; abandon the session and its buffers
        if n == 0 {
            return Ok(SessionEnd::Closed);
        }

        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }

        let result = session.handle_line(&line).await;
        if !result.response.is_empty() {
            reader.get_mut().write_all(&result.response).await?;
        }
        if result.start_tls {
            return Ok(SessionEnd::StartTls(reader.into_inner()));
        }
        if result.should_close {
            return Ok(SessionEnd::Closed);
        }
    }
}
