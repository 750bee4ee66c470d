/// Inbound SMTP engine and direct-to-MX outbound delivery
mod command;
pub mod delivery;
mod response;
pub mod server;
mod session;

pub use command::{parse_command, SmtpCommand};
pub use response::SmtpResponse;
pub use server::{serve, Relay};
pub use session::{Envelope, ResolvedRecipient, SmtpResult, SmtpSession, SmtpState};
