//! Webhook authenticity checks.
//!
//! Two strategies: an HMAC signature computed over the raw request body
//! (GitHub), and a shared token echoed in a header (GitLab). Both compare in
//! constant time.

use crate::errors::RejectReason;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Key for the token digests. Both sides are digested with it so the final
/// comparison is between equal-length tags.
const TOKEN_DIGEST_KEY: &[u8] = b"stage-ci/token-compare";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Authentic,
    Rejected(RejectReason),
}

#[cfg(test)]
impl Verdict {
    pub fn is_authentic(&self) -> bool {
        matches!(self, Verdict::Authentic)
    }
}

/// Check a `sha1=<hex>` or `sha256=<hex>` signature header against `body`.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header_name: &'static str,
    signature: Option<&str>,
) -> Verdict {
    let Some(signature) = signature else {
        return Verdict::Rejected(RejectReason::MissingHeader(header_name));
    };

    let Some((algorithm, digest)) = signature.trim().split_once('=') else {
        return Verdict::Rejected(RejectReason::MalformedSignature);
    };

    let Ok(expected) = hex::decode(digest) else {
        return Verdict::Rejected(RejectReason::MalformedSignature);
    };

    match algorithm {
        "sha1" => verify_mac::<HmacSha1>(secret.as_bytes(), body, &expected),
        "sha256" => verify_mac::<HmacSha256>(secret.as_bytes(), body, &expected),
        _ => Verdict::Rejected(RejectReason::MalformedSignature),
    }
}

/// Check a shared token header against the configured value.
pub fn verify_token(expected: &str, header_name: &'static str, provided: Option<&str>) -> Verdict {
    let Some(provided) = provided else {
        return Verdict::Rejected(RejectReason::MissingHeader(header_name));
    };

    let (Some(expected_mac), Some(provided_mac)) = (token_mac(expected), token_mac(provided))
    else {
        return Verdict::Rejected(RejectReason::TokenMismatch);
    };

    let tag = expected_mac.finalize().into_bytes();
    match provided_mac.verify_slice(&tag) {
        Ok(()) => Verdict::Authentic,
        Err(_) => Verdict::Rejected(RejectReason::TokenMismatch),
    }
}

fn token_mac(value: &str) -> Option<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(TOKEN_DIGEST_KEY).ok()?;
    mac.update(value.as_bytes());
    Some(mac)
}

fn verify_mac<M: Mac + KeyInit>(secret: &[u8], body: &[u8], expected: &[u8]) -> Verdict {
    let Ok(mut mac) = <M as KeyInit>::new_from_slice(secret) else {
        return Verdict::Rejected(RejectReason::SignatureMismatch);
    };
    mac.update(body);

    match mac.verify_slice(expected) {
        Ok(()) => Verdict::Authentic,
        Err(_) => Verdict::Rejected(RejectReason::SignatureMismatch),
    }
}

/// Produce a `sha1=<hex>` signature the way GitHub does. Used by tests.
#[cfg(test)]
pub fn sign_sha1(secret: &str, body: &[u8]) -> String {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}
