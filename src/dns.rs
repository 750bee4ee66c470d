use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, TokioResolver};

use crate::error::RelayError;

/// One MX record, trailing dot trimmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

/// Typed MX and TXT lookups with error classification
///
/// NXDOMAIN and empty answers become permanent (550) errors; transport
/// failures become transient (421) errors so the upstream retries.
pub struct DnsFacade {
    resolver: TokioResolver,
}

impl DnsFacade {
    pub fn new() -> Result<Self, RelayError> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| RelayError::TransientDns(format!("failed to create resolver: {}", e)))?
            .build();
        Ok(Self { resolver })
    }

    /// Resolve the MX set of a domain, sorted ascending by priority
    pub async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, RelayError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(response) => {
                let mut records: Vec<MxRecord> = response
                    .iter()
                    .map(|mx| MxRecord {
                        exchange: mx
                            .exchange()
                            .to_string()
                            .trim_end_matches('.')
                            .to_lowercase(),
                        priority: mx.preference(),
                    })
                    .collect();
                if records.is_empty() {
                    return Err(no_mx(domain));
                }
                records.sort_by_key(|r| r.priority);
                Ok(records)
            }
            Err(e) if is_no_records(&e) => Err(no_mx(domain)),
            Err(e) => Err(RelayError::TransientDns(format!(
                "MX lookup for {} failed: {}",
                domain, e
            ))),
        }
    }

    /// Resolve the TXT records of a domain
    ///
    /// Records split into ≤255-byte character-strings are joined back into
    /// one string per record before being returned.
    pub async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, RelayError> {
        match self.resolver.txt_lookup(domain).await {
            Ok(response) => {
                let records: Vec<String> = response.iter().map(join_txt_chunks).collect();
                if records.is_empty() {
                    return Err(no_txt(domain));
                }
                Ok(records)
            }
            Err(e) if is_no_records(&e) => Err(no_txt(domain)),
            Err(e) => Err(RelayError::TransientDns(format!(
                "TXT lookup for {} failed: {}",
                domain, e
            ))),
        }
    }
}

fn no_mx(domain: &str) -> RelayError {
    RelayError::InvalidMx(format!("Domain {} has no MX records", domain))
}

fn no_txt(domain: &str) -> RelayError {
    RelayError::InvalidTxt(format!("Domain {} has no TXT records", domain))
}

/// Concatenate the character-string chunks of a single TXT record
fn join_txt_chunks(txt: &hickory_resolver::proto::rr::rdata::TXT) -> String {
    let mut joined = Vec::new();
    for chunk in txt.txt_data() {
        joined.extend_from_slice(chunk);
    }
    String::from_utf8_lossy(&joined).into_owned()
}

/// Distinguish "the name has no such records" from a transport failure
fn is_no_records(err: &ResolveError) -> bool {
    match err.kind() {
        ResolveErrorKind::Proto(proto) => {
            matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. })
        }
        _ => false,
    }
}
