use std::collections::HashSet;
use std::sync::OnceLock;

use crate::error::RelayError;

/// Disposable deny-list bundled at build time, parsed once on first use
static DISPOSABLE: OnceLock<DisposableList> = OnceLock::new();

const DISPOSABLE_DOMAINS: &str = include_str!("../resources/disposable_domains.txt");

struct DisposableList {
    exact: HashSet<String>,
    /// Base domains of `*.` entries; any subdomain of these matches
    wildcards: Vec<String>,
}

fn disposable_list() -> &'static DisposableList {
    DISPOSABLE.get_or_init(|| {
        let mut exact = HashSet::new();
        let mut wildcards = Vec::new();
        for line in DISPOSABLE_DOMAINS.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(base) = line.strip_prefix("*.") {
                wildcards.push(base.to_lowercase());
            } else {
                exact.insert(line.to_lowercase());
            }
        }
        DisposableList { exact, wildcards }
    })
}

/// Check a domain against the disposable deny-list (exact + wildcard suffix)
pub fn is_disposable(domain: &str) -> bool {
    let domain = domain.to_lowercase();
    let list = disposable_list();
    if list.exact.contains(&domain) {
        return true;
    }
    list.wildcards
        .iter()
        .any(|base| domain == *base || domain.ends_with(&format!(".{}", base)))
}

/// Check whether a hostname is a fully qualified domain name
pub fn is_fqdn(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
    }
    // TLD must be alphabetic (rules out bare IP addresses)
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Split an address at the last `@` into (local-part, domain)
fn split_address(address: &str) -> Result<(&str, &str), RelayError> {
    let address = address.trim();
    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok((local, domain)),
        _ => Err(RelayError::InvalidDomain(format!(
            "Address {} is missing a local part or domain",
            address
        ))),
    }
}

/// Local part with any `+tag` suffix stripped, lowercased
///
/// `"Hello+spam@x.com"` parses to `"hello"`.
pub fn parse_local(address: &str) -> Result<String, RelayError> {
    let (local, _) = split_address(address)?;
    let local = match local.split_once('+') {
        Some((name, _)) => name,
        None => local,
    };
    Ok(local.to_lowercase())
}

/// The `+tag` filter of an address without the `+`, or an empty string
pub fn parse_filter(address: &str) -> String {
    split_address(address)
        .ok()
        .and_then(|(local, _)| local.split_once('+'))
        .map(|(_, tag)| tag.to_lowercase())
        .unwrap_or_default()
}

/// Domain of an address, validated as a non-disposable FQDN
pub fn parse_domain(address: &str) -> Result<String, RelayError> {
    let (_, domain) = split_address(address)?;
    let domain = domain.trim_end_matches('.').to_lowercase();
    if !is_fqdn(&domain) {
        return Err(RelayError::InvalidDomain(format!(
            "Domain {} is not a fully qualified domain name",
            domain
        )));
    }
    if is_disposable(&domain) {
        return Err(RelayError::InvalidDomain(format!(
            "Disposable email domain {} is not allowed",
            domain
        )));
    }
    Ok(domain)
}

/// True when the string looks like an email address on a FQDN
pub fn is_valid_email(address: &str) -> bool {
    match split_address(address) {
        Ok((local, domain)) => {
            !local.contains(char::is_whitespace) && is_fqdn(domain.trim_end_matches('.'))
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_strips_plus_tag() {
        assert_eq!(parse_local("hello+spam@example.com").unwrap(), "hello");
        assert_eq!(parse_local("hello@example.com").unwrap(), "hello");
        assert_eq!(parse_local("Hello+A+B@example.com").unwrap(), "hello");
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter("hello+spam@example.com"), "spam");
        assert_eq!(parse_filter("hello@example.com"), "");
        assert_eq!(parse_filter("hello+a+b@example.com"), "a+b");
    }

    #[test]
    fn test_parse_domain() {
        assert_eq!(parse_domain("user@Example.COM").unwrap(), "example.com");
        assert!(parse_domain("user@localhost").is_err());
        assert!(parse_domain("user@").is_err());
        assert!(parse_domain("user").is_err());
        assert!(parse_domain("user@999.999.999.999").is_err());
    }

    #[test]
    fn test_disposable_domain_rejected() {
        let err = parse_domain("someone@mailinator.com").unwrap_err();
        assert!(err.to_string().contains("Disposable"));
        assert_eq!(err.smtp_code(), 550);
    }

    #[test]
    fn test_disposable_wildcard_suffix() {
        assert!(is_disposable("mailinator.com"));
        assert!(is_disposable("foo.bar.mailinator.com"));
        assert!(!is_disposable("notmailinator.com"));
        assert!(!is_disposable("gmail.com"));
    }

    #[test]
    fn test_is_fqdn() {
        assert!(is_fqdn("example.com"));
        assert!(is_fqdn("mx1.forwardemail.net"));
        assert!(is_fqdn("example.com."));
        assert!(!is_fqdn("localhost"));
        assert!(!is_fqdn("-bad.example.com"));
        assert!(!is_fqdn("exa mple.com"));
        assert!(!is_fqdn("192.168.0.1"));
        assert!(!is_fqdn(""));
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("user@example.com"));
        assert!(!is_valid_email("user@localhost"));
        assert!(!is_valid_email("example.com"));
    }
}
