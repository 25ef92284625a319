//! Streaming DKIM-Signature verifier. Grounded on NwSMTP's `adkim.cpp`/
//! `adkim.h`; this is the one check implemented from scratch here (the
//! contract is "verify a signature", not "reimplement SASL/SPF wire
//! protocols").
//!
//! Fed CRLF-normalised, dot-unstuffed bytes — the same transform the EOM
//! parser performs — so the body hash matches what was actually signed
//! regardless of how the message arrived split across TCP segments.

use base64::decode as b64_decode;
use rsa::{
    pkcs1::FromRsaPublicKey, pkcs8::FromPublicKey, Hash, PaddingScheme, PublicKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use trust_dns_proto::rr::Name;

use crate::dns::DnsClient;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DkimStatus {
    Pass,
    Fail,
    Neutral,
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum DkimError {
    #[error("no DKIM-Signature header present")]
    NoSignature,
    #[error("malformed DKIM-Signature header: {0}")]
    Malformed(&'static str),
    #[error("failed to fetch public key: {0}")]
    Dns(#[from] crate::dns::DnsError),
    #[error("no public key published at selector")]
    NoPublicKey,
    #[error("public key is not valid RSA/base64")]
    BadPublicKey,
}

struct Signature {
    domain: String,
    selector: String,
    identity: Option<String>,
    body_hash: Vec<u8>,
    signature: Vec<u8>,
    header_names: Vec<String>,
}

/// Incrementally hashes a message body with "simple" canonicalization
/// (trailing empty lines collapsed to a single CRLF, no further rewriting),
/// fed chunk by chunk as bytes arrive from the streambuf.
pub struct BodyHasher {
    hasher: Sha256,
    trailing_crlfs: usize,
    any_bytes: bool,
}

impl BodyHasher {
    pub fn new() -> BodyHasher {
        BodyHasher {
            hasher: Sha256::new(),
            trailing_crlfs: 0,
            any_bytes: false,
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) {
        while !chunk.is_empty() {
            if chunk.starts_with(b"\r\n") {
                self.trailing_crlfs += 1;
                chunk = &chunk[2..];
            } else {
                for _ in 0..self.trailing_crlfs {
                    self.hasher.update(b"\r\n");
                }
                self.trailing_crlfs = 0;
                let next_crlf = chunk.windows(2).position(|w| w == b"\r\n").unwrap_or(chunk.len());
                self.hasher.update(&chunk[..next_crlf]);
                self.any_bytes = true;
                chunk = &chunk[next_crlf..];
            }
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.any_bytes {
            self.hasher.update(b"\r\n");
        }
        self.hasher.finalize().to_vec()
    }
}

impl Default for BodyHasher {
    fn default() -> BodyHasher {
        BodyHasher::new()
    }
}

pub struct DkimVerifier<'a> {
    dns: &'a DnsClient,
}

impl<'a> DkimVerifier<'a> {
    pub fn new(dns: &'a DnsClient) -> DkimVerifier<'a> {
        DkimVerifier { dns }
    }

    #[tracing::instrument(skip(self, headers, body_hash))]
    pub async fn verify(
        &self,
        headers: &[(String, String)],
        body_hash: &[u8],
    ) -> Result<(DkimStatus, Option<String>), DkimError> {
        let sig_header = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("DKIM-Signature"))
            .ok_or(DkimError::NoSignature)?;
        let signature = parse_signature(&sig_header.1)?;

        if signature.body_hash != body_hash {
            return Ok((DkimStatus::Fail, signature.identity));
        }

        let key = match self.fetch_public_key(&signature.selector, &signature.domain).await {
            Ok(key) => key,
            Err(DkimError::NoPublicKey) => return Ok((DkimStatus::None, signature.identity)),
            Err(e) => return Err(e),
        };

        let signed_data = canonicalize_headers(headers, &signature.header_names, &sig_header.1);
        let digest = Sha256::digest(&signed_data);

        let verified = key
            .verify(
                PaddingScheme::PKCS1v15Sign {
                    hash: Some(Hash::SHA2_256),
                },
                &digest,
                &signature.signature,
            )
            .is_ok();

        Ok((
            if verified { DkimStatus::Pass } else { DkimStatus::Fail },
            signature.identity,
        ))
    }

    async fn fetch_public_key(&self, selector: &str, domain: &str) -> Result<RsaPublicKey, DkimError> {
        let name = Name::from_ascii(format!("{}._domainkey.{}.", selector, domain))
            .map_err(|_| DkimError::Malformed("selector/domain"))?;
        let txts = self.dns.resolve_txt(&name).await?;
        let record = txts.into_iter().find(|t| t.contains("k=rsa") || t.contains("p="));
        let record = record.ok_or(DkimError::NoPublicKey)?;
        let p_tag = record
            .split(';')
            .find_map(|part| part.trim().strip_prefix("p="))
            .ok_or(DkimError::NoPublicKey)?;
        let der = b64_decode(p_tag.trim()).map_err(|_| DkimError::BadPublicKey)?;
        RsaPublicKey::from_pkcs1_der(&der)
            .or_else(|_| RsaPublicKey::from_public_key_der(&der))
            .map_err(|_| DkimError::BadPublicKey)
    }
}

fn parse_signature(header_value: &str) -> Result<Signature, DkimError> {
    let mut domain = None;
    let mut selector = None;
    let mut identity = None;
    let mut body_hash = None;
    let mut signature = None;
    let mut header_names = Vec::new();

    for tag in header_value.split(';') {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let (key, value) = tag.split_once('=').ok_or(DkimError::Malformed("tag"))?;
        match key.trim() {
            "d" => domain = Some(value.trim().to_string()),
            "s" => selector = Some(value.trim().to_string()),
            "i" => identity = Some(value.trim().to_string()),
            "bh" => body_hash = Some(b64_decode(value.trim()).map_err(|_| DkimError::Malformed("bh"))?),
            "b" => {
                let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
                signature = Some(b64_decode(&cleaned).map_err(|_| DkimError::Malformed("b"))?);
            }
            "h" => header_names = value.split(':').map(|s| s.trim().to_string()).collect(),
            _ => {}
        }
    }

    Ok(Signature {
        domain: domain.ok_or(DkimError::Malformed("d"))?,
        selector: selector.ok_or(DkimError::Malformed("s"))?,
        identity,
        body_hash: body_hash.ok_or(DkimError::Malformed("bh"))?,
        signature: signature.ok_or(DkimError::Malformed("b"))?,
        header_names,
    })
}

/// "Relaxed" canonicalization of the signed header set plus the
/// `DKIM-Signature` header itself with its `b=` tag value stripped.
fn canonicalize_headers(headers: &[(String, String)], names: &[String], sig_header_value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for name in names {
        if let Some((_, value)) = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            out.extend_from_slice(name.to_ascii_lowercase().as_bytes());
            out.extend_from_slice(b":");
            out.extend_from_slice(collapse_whitespace(value).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    let stripped = strip_b_tag(sig_header_value);
    out.extend_from_slice(b"dkim-signature:");
    out.extend_from_slice(collapse_whitespace(&stripped).as_bytes());
    out
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::new();
    let mut last_was_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn strip_b_tag(header_value: &str) -> String {
    header_value
        .split(';')
        .map(|tag| {
            if tag.trim_start().starts_with('b') && tag.trim_start()[1..].trim_start().starts_with('=') {
                " b="
            } else {
                tag
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_hasher_collapses_trailing_blank_lines() {
        let mut hasher = BodyHasher::new();
        hasher.push(b"hello\r\n\r\n\r\n");
        let a = hasher.finish();

        let mut hasher = BodyHasher::new();
        hasher.push(b"hello\r\n");
        let b = hasher.finish();

        assert_eq!(a, b);
    }

    #[test]
    fn parses_required_tags() {
        let sig = parse_signature("v=1; a=rsa-sha256; d=example.org; s=sel; bh=AAAA; b=BBBB; h=from:to").unwrap();
        assert_eq!(sig.domain, "example.org");
        assert_eq!(sig.selector, "sel");
        assert_eq!(sig.header_names, vec!["from".to_string(), "to".to_string()]);
    }
}
