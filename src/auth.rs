use std::net::IpAddr;

use mail_auth::{AuthenticatedMessage, DkimResult, Resolver, SpfResult};

use crate::error::RelayError;

/// SPF and DKIM verification for inbound messages
///
/// Both checks run against the exact raw bytes received on the wire; the
/// outbound signer re-canonicalizes separately and never shares this path.
pub struct Authenticator {
    resolver: Resolver,
}

impl Authenticator {
    pub fn new() -> Result<Self, RelayError> {
        let resolver = Resolver::new_system_conf()
            .map_err(|e| RelayError::TransientDns(format!("failed to create resolver: {}", e)))?;
        Ok(Self { resolver })
    }

    /// SPF pass/fail for the remote IP against the MAIL FROM identity
    ///
    /// A definitive failure returns `Ok(false)` and is not by itself fatal;
    /// only a verifier transport error becomes a 421.
    pub async fn verify_spf(
        &self,
        remote_ip: IpAddr,
        mail_from: &str,
        helo: &str,
        hostname: &str,
    ) -> Result<bool, RelayError> {
        // The null sender is checked as postmaster@<helo> per RFC 7208
        let output = if mail_from.is_empty() {
            self.resolver
                .verify_spf_sender(remote_ip, helo, hostname, &format!("postmaster@{}", helo))
                .await
        } else {
            self.resolver
                .verify_spf_sender(remote_ip, helo, hostname, &mail_from.to_lowercase())
                .await
        };
        match output.result() {
            SpfResult::Pass => Ok(true),
            SpfResult::TempError => Err(RelayError::TransientSpf(format!(
                "SPF lookup for {} did not complete",
                if mail_from.is_empty() { helo } else { mail_from }
            ))),
            _ => Ok(false),
        }
    }

    /// True when any DKIM signature on the raw message verifies
    pub async fn verify_dkim(&self, raw: &[u8]) -> Result<bool, RelayError> {
        let message = match AuthenticatedMessage::parse(raw) {
            Some(message) => message,
            None => return Ok(false),
        };
        let outputs = self.resolver.verify_dkim(&message).await;
        if outputs.iter().any(|o| matches!(o.result(), DkimResult::Pass)) {
            return Ok(true);
        }
        if let Some(output) = outputs
            .iter()
            .find(|o| matches!(o.result(), DkimResult::TempError(_)))
        {
            return Err(RelayError::TransientDkim(format!(
                "DKIM verification did not complete: {:?}",
                output.result()
            )));
        }
        Ok(false)
    }
}
