use std::io;
use std::time::Duration;

/// Error type shared by every stage of the relay
///
/// Each variant corresponds to one SMTP reply; the session state machine is
/// the only place that turns these into wire replies, via `smtp_code()`.
#[derive(Debug)]
pub enum RelayError {
    /// CONNECT/HELO: client hostname is not a FQDN
    BadClientHostname(String),
    /// Address domain is not a FQDN, or is on the disposable deny-list
    InvalidDomain(String),
    /// Missing or malformed forward-email= TXT record
    InvalidTxt(String),
    /// No MX records, or the recipient MX set lacks our exchanges
    InvalidMx(String),
    /// Sender is over quota
    RateLimited { retry: Duration },
    /// DATA exceeded the configured maximum size
    MessageTooLarge { size: usize, limit: usize },
    /// Both SPF and DKIM failed
    ProvenanceFailed,
    /// DNS transport failure
    TransientDns(String),
    /// SPF verifier transport failure
    TransientSpf(String),
    /// DKIM verifier transport failure
    TransientDkim(String),
    /// A downstream MX returned a 4xx/5xx; code and message pass through
    Downstream { code: u16, message: String },
    /// Every exchange of a recipient failed before yielding an SMTP reply
    DeliveryFailed(String),
    /// Local processing error (signing, serialization)
    Internal(String),
    /// Socket-level failure on the inbound session
    Io(io::Error),
}

impl RelayError {
    /// SMTP reply code for this error
    pub fn smtp_code(&self) -> u16 {
        match self {
            Self::BadClientHostname(_)
            | Self::InvalidDomain(_)
            | Self::InvalidTxt(_)
            | Self::InvalidMx(_)
            | Self::ProvenanceFailed => 550,
            Self::RateLimited { .. } => 451,
            Self::MessageTooLarge { .. } => 450,
            Self::TransientDns(_)
            | Self::TransientSpf(_)
            | Self::TransientDkim(_)
            | Self::DeliveryFailed(_)
            | Self::Io(_) => 421,
            Self::Downstream { code, .. } => *code,
            Self::Internal(_) => 451,
        }
    }

    /// True for permanent (5xx) failures
    pub fn is_permanent(&self) -> bool {
        self.smtp_code() >= 500
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadClientHostname(host) => {
                write!(f, "Client hostname {} is not a fully qualified domain name", host)
            }
            Self::InvalidDomain(msg) => write!(f, "{}", msg),
            Self::InvalidTxt(msg) => write!(f, "{}", msg),
            Self::InvalidMx(msg) => write!(f, "{}", msg),
            Self::RateLimited { retry } => {
                write!(f, "Rate limit exceeded, retry in {}", humanize(*retry))
            }
            Self::MessageTooLarge { size, limit } => {
                write!(f, "Message size {} exceeds maximum of {} bytes", size, limit)
            }
            Self::ProvenanceFailed => write!(f, "No passing DKIM signature found"),
            Self::TransientDns(msg) => write!(f, "Temporary DNS error: {}", msg),
            Self::TransientSpf(msg) => write!(f, "Temporary SPF validation error: {}", msg),
            Self::TransientDkim(msg) => write!(f, "Temporary DKIM validation error: {}", msg),
            Self::Downstream { message, .. } => write!(f, "{}", message),
            Self::DeliveryFailed(msg) => write!(f, "Delivery failed: {}", msg),
            Self::Internal(msg) => write!(f, "Local error in processing: {}", msg),
            Self::Io(e) => write!(f, "Connection error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Render a duration as a coarse human-readable retry hint
fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        let hours = secs / 3600;
        format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if secs >= 120 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs.max(1))
    }
}
