use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::{
    pkcs1v15::SigningKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    signature::{RandomizedSigner, SignatureEncoding},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;

const DKIM_KEY_SIZE: usize = 2048;

/// Headers included in the outbound signature, in signing order
const SIGNED_HEADERS: [&str; 5] = ["from", "to", "subject", "date", "message-id"];

/// RSA key pair used to sign every relayed message with our own identity
pub struct DkimKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl DkimKeyPair {
    /// Generate a new key pair
    pub fn generate() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, DKIM_KEY_SIZE)?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    /// Load the private key from a PKCS#8 PEM file
    pub async fn from_pem_file(
        path: &Path,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let pem = fs::read_to_string(path).await?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    /// Load an existing key from `dir`, generating and saving one if absent
    pub async fn load_or_generate(
        dir: &Path,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let key_path = dir.join("dkim_private.pem");
        if key_path.exists() {
            return Self::from_pem_file(&key_path).await;
        }
        let keypair = Self::generate()?;
        fs::create_dir_all(dir).await?;
        let pem = keypair.private_key.to_pkcs8_pem(LineEnding::LF)?;
        fs::write(&key_path, pem.as_bytes()).await?;
        Ok(keypair)
    }

    /// Public key in base64 SPKI form, as published in the selector record
    pub fn public_key_base64(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let der = self.public_key.to_public_key_der()?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// Sign a message, returning it with a DKIM-Signature header prepended
    ///
    /// rsa-sha256 with relaxed header / simple body canonicalization
    /// (RFC 6376 sections 3.4.2 and 3.4.3).
    pub fn sign(
        &self,
        message: &[u8],
        selector: &str,
        domain: &str,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let text = String::from_utf8_lossy(message);
        let (headers, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => match text.find("\n\n") {
                Some(pos) => (&text[..pos], &text[pos + 2..]),
                None => (text.as_ref(), ""),
            },
        };

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body(body).as_bytes()));

        let mut signed_names = Vec::new();
        let mut header_text = String::new();
        for name in SIGNED_HEADERS {
            if let Some(canonical) = relaxed_header(headers, name) {
                signed_names.push(name);
                header_text.push_str(&canonical);
                header_text.push_str("\r\n");
            }
        }

        let timestamp = std::time::SystemTime::UNIX_EPOCH
            .elapsed()
            .unwrap_or_default()
            .as_secs();
        let tags = format!(
            "v=1; a=rsa-sha256; c=relaxed/simple; d={}; s={}; t={}; bh={}; h={}; b=",
            domain,
            selector,
            timestamp,
            body_hash,
            signed_names.join(":")
        );

        // The signature header itself is signed last, without a trailing CRLF
        header_text.push_str("dkim-signature:");
        header_text.push_str(&tags);

        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), header_text.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let mut header = format!("DKIM-Signature: {}", tags);
        for (i, chunk) in signature_b64.as_bytes().chunks(72).enumerate() {
            if i > 0 {
                header.push_str("\r\n\t");
            }
            header.push_str(&String::from_utf8_lossy(chunk));
        }
        header.push_str("\r\n");

        let mut signed = header.into_bytes();
        signed.extend_from_slice(message);
        Ok(signed)
    }
}

/// Simple body canonicalization: CRLF line endings, single trailing CRLF
fn canonicalize_body(body: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    let mut canonical = body.replace("\r\n", "\n").replace('\n', "\r\n");
    while canonical.ends_with("\r\n\r\n") {
        canonical.truncate(canonical.len() - 2);
    }
    if !canonical.ends_with("\r\n") {
        canonical.push_str("\r\n");
    }
    canonical
}

/// Relaxed canonicalization of the first header named `name`, unfolded
fn relaxed_header(headers: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;
    for line in headers.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(ref mut v) = value {
            if line.starts_with(' ') || line.starts_with('\t') {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
            break;
        }
        let lower = line.to_lowercase();
        if lower.starts_with(name) && line[name.len()..].trim_start().starts_with(':') {
            let colon = line.find(':').unwrap();
            value = Some(line[colon + 1..].trim().to_string());
        }
    }
    value.map(|v| {
        let collapsed = v.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{}:{}", name, collapsed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_or_generate_roundtrip() {
        let dir = tempdir().unwrap();
        let first = DkimKeyPair::load_or_generate(dir.path()).await.unwrap();
        let second = DkimKeyPair::load_or_generate(dir.path()).await.unwrap();
        assert_eq!(
            first.public_key_base64().unwrap(),
            second.public_key_base64().unwrap()
        );
    }

    #[tokio::test]
    async fn test_from_pem_file_missing() {
        let dir = tempdir().unwrap();
        assert!(DkimKeyPair::from_pem_file(&dir.path().join("nope.pem"))
            .await
            .is_err());
    }

    #[test]
    fn test_sign_prepends_header() {
        let keypair = DkimKeyPair::generate().unwrap();
        let message = b"From: sender@example.com\r\n\
                        To: recipient@example.org\r\n\
                        Subject: Test email\r\n\
                        Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
                        Message-ID: <test@example.com>\r\n\
                        \r\n\
                        Hello, this is a test email.\r\n";

        let signed = keypair.sign(message, "default", "example.com").unwrap();
        let signed_str = String::from_utf8_lossy(&signed);

        assert!(signed_str.starts_with("DKIM-Signature:"));
        assert!(signed_str.contains("a=rsa-sha256"));
        assert!(signed_str.contains("c=relaxed/simple"));
        assert!(signed_str.contains("d=example.com"));
        assert!(signed_str.contains("s=default"));
        assert!(signed_str.contains("bh="));
        assert!(signed_str.contains("h=from:to:subject:date:message-id"));

        // Original message is intact below the new header
        assert!(signed_str.contains("From: sender@example.com"));
        assert!(signed_str.contains("Hello, this is a test email."));
    }

    #[test]
    fn test_sign_skips_absent_headers() {
        let keypair = DkimKeyPair::generate().unwrap();
        let message = b"From: sender@example.com\r\n\r\nBody\r\n";
        let signed = keypair.sign(message, "sel", "example.com").unwrap();
        let signed_str = String::from_utf8_lossy(&signed);
        assert!(signed_str.contains("h=from; b="));
    }

    #[test]
    fn test_canonicalize_body() {
        assert_eq!(canonicalize_body(""), "");
        assert_eq!(canonicalize_body("hi"), "hi\r\n");
        assert_eq!(canonicalize_body("hi\n\n\n"), "hi\r\n");
        assert_eq!(canonicalize_body("a\nb\n"), "a\r\nb\r\n");
    }

    #[test]
    fn test_relaxed_header_unfolds() {
        let headers = "Subject: a very\r\n\tlong   subject\r\nFrom: x@y.com";
        assert_eq!(
            relaxed_header(headers, "subject").unwrap(),
            "subject:a very long subject"
        );
        assert_eq!(relaxed_header(headers, "from").unwrap(), "from:x@y.com");
        assert_eq!(relaxed_header(headers, "date"), None);
    }
}
