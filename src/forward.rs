use crate::address::{is_valid_email, parse_domain, parse_filter, parse_local};
use crate::dns::DnsFacade;
use crate::error::RelayError;

/// TXT record prefix that marks a forwarding configuration
pub const TXT_PREFIX: &str = "forward-email=";

/// Forwarding mapping parsed from one `forward-email=` TXT record
///
/// Entries are either `local:address` pairs or a bare address acting as the
/// wildcard redirect for the whole domain. Per-user entries always take
/// precedence over the wildcard, regardless of their order in the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingTable {
    wildcard: Option<String>,
    entries: Vec<(String, String)>,
}

impl ForwardingTable {
    /// Parse the first `forward-email=` record out of a TXT record set
    pub fn parse(records: &[String]) -> Result<Self, RelayError> {
        let record = records
            .iter()
            .map(|r| r.trim())
            .find_map(|r| r.strip_prefix(TXT_PREFIX))
            .ok_or_else(|| {
                RelayError::InvalidTxt("No forward-email TXT record found".to_string())
            })?;

        let mut wildcard = None;
        let mut entries = Vec::new();
        for entry in record.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once(':') {
                Some((local, address)) => {
                    let local = local.trim().to_lowercase();
                    let address = address.trim();
                    if local.is_empty() || !is_valid_email(address) {
                        return Err(malformed(entry));
                    }
                    entries.push((local, address.to_string()));
                }
                None => {
                    if !is_valid_email(entry) {
                        return Err(malformed(entry));
                    }
                    // First bare address wins as the wildcard redirect
                    wildcard.get_or_insert_with(|| entry.to_string());
                }
            }
        }

        if wildcard.is_none() && entries.is_empty() {
            return Err(RelayError::InvalidTxt(
                "forward-email TXT record has no entries".to_string(),
            ));
        }
        Ok(Self { wildcard, entries })
    }

    /// Forwarding target for a recipient, per-user match first, then wildcard
    pub fn target(&self, local: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(l, _)| l == local)
            .map(|(_, a)| a.as_str())
            .or(self.wildcard.as_deref())
    }

    /// Compute the forwarded envelope address for `recipient`
    ///
    /// The plus-tag travels with the message: `u+f@d` forwarded to `t@e`
    /// resolves to `local(t)+f@e`. Untagged recipients get the target
    /// verbatim.
    pub fn resolve(&self, recipient: &str) -> Result<String, RelayError> {
        let local = parse_local(recipient)?;
        let target = self.target(&local).ok_or_else(|| {
            RelayError::InvalidTxt(format!("No forwarding entry for {}", recipient))
        })?;
        let filter = parse_filter(recipient);
        if filter.is_empty() {
            return Ok(target.to_string());
        }
        Ok(format!(
            "{}+{}@{}",
            parse_local(target)?,
            filter,
            parse_domain(target)?
        ))
    }
}

fn malformed(entry: &str) -> RelayError {
    RelayError::InvalidTxt(format!("Malformed forward-email entry: {}", entry))
}

/// Resolve a recipient's forwarding address against live DNS
pub async fn resolve_forward(dns: &DnsFacade, recipient: &str) -> Result<String, RelayError> {
    let domain = parse_domain(recipient)?;
    let records = dns.resolve_txt(&domain).await?;
    ForwardingTable::parse(&records)?.resolve(recipient)
}
