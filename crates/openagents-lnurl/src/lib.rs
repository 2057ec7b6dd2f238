//! LNURL primitives used by the OpenAgents LNURL bridge.
//!
//! Covers the pieces of LUD-01/LUD-04 the bridge relies on: random `k1`
//! challenges, bech32 LNURL encoding, and verification of the secp256k1
//! signature a wallet produces over a `k1`. A minimal BOLT11 amount parser
//! is included for payment-request sanity checks.

use bech32::{Bech32, Hrp};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1};

const LNURL_HRP: &str = "lnurl";
const K1_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LnurlError {
    #[error("k1 must be 32 bytes of hex: {0}")]
    InvalidK1(String),
    #[error("signature is not valid DER hex: {0}")]
    InvalidSignatureEncoding(String),
    #[error("key is not a valid secp256k1 public key: {0}")]
    InvalidPublicKey(String),
    #[error("signature does not match k1 and key")]
    SignatureMismatch,
    #[error("failed to encode lnurl: {0}")]
    Encode(String),
    #[error("failed to decode lnurl: {0}")]
    Decode(String),
}

/// Generate a fresh `k1` challenge: 32 random bytes, lowercase hex.
#[must_use]
pub fn random_k1() -> String {
    let bytes: [u8; K1_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Bech32-encode a URL as an upper-case LNURL string.
pub fn encode_lnurl(url: &str) -> Result<String, LnurlError> {
    let hrp = Hrp::parse(LNURL_HRP).map_err(|error| LnurlError::Encode(error.to_string()))?;
    bech32::encode_upper::<Bech32>(hrp, url.as_bytes())
        .map_err(|error| LnurlError::Encode(error.to_string()))
}

/// Decode an LNURL string back to the URL it wraps.
pub fn decode_lnurl(lnurl: &str) -> Result<String, LnurlError> {
    let (hrp, data) =
        bech32::decode(lnurl.trim()).map_err(|error| LnurlError::Decode(error.to_string()))?;
    if !hrp.as_str().eq_ignore_ascii_case(LNURL_HRP) {
        return Err(LnurlError::Decode(format!(
            "unexpected human-readable part '{hrp}'"
        )));
    }
    String::from_utf8(data).map_err(|error| LnurlError::Decode(error.to_string()))
}

/// Verify an LNURL-auth style signature.
///
/// `sig` is a hex DER-encoded ECDSA signature, `key` a hex compressed (or
/// uncompressed) secp256k1 public key, and `k1` the 32-byte hex challenge
/// that was signed directly (no additional hashing). High-S signatures are
/// normalized before verification since several wallets emit them.
pub fn verify_signature(k1: &str, sig: &str, key: &str) -> Result<(), LnurlError> {
    let k1_bytes = decode_k1(k1)?;

    let sig_bytes = hex::decode(sig.trim())
        .map_err(|error| LnurlError::InvalidSignatureEncoding(error.to_string()))?;
    let mut signature = Signature::from_der(&sig_bytes)
        .map_err(|error| LnurlError::InvalidSignatureEncoding(error.to_string()))?;
    signature.normalize_s();

    let key_bytes =
        hex::decode(key.trim()).map_err(|error| LnurlError::InvalidPublicKey(error.to_string()))?;
    let public_key = PublicKey::from_slice(&key_bytes)
        .map_err(|error| LnurlError::InvalidPublicKey(error.to_string()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(k1_bytes), &signature, &public_key)
        .map_err(|_| LnurlError::SignatureMismatch)
}

fn decode_k1(k1: &str) -> Result<[u8; K1_BYTES], LnurlError> {
    let raw = hex::decode(k1.trim()).map_err(|error| LnurlError::InvalidK1(error.to_string()))?;
    <[u8; K1_BYTES]>::try_from(raw.as_slice())
        .map_err(|_| LnurlError::InvalidK1(format!("got {} bytes", raw.len())))
}

/// Minimal BOLT11 amount parser.
#[derive(Debug, Clone, Copy)]
pub struct Bolt11;

impl Bolt11 {
    /// Parse the amount of a BOLT11 payment request in millisatoshis.
    ///
    /// The human-readable part ends at the last `1` in the string (the
    /// bech32 data charset has no `1`), so currency prefixes of any length
    /// (`bc`, `tb`, `bcrt`, ...) are accepted. Returns `None` for amountless
    /// requests, malformed input, unsupported multipliers, sub-millisatoshi
    /// pico amounts, and 64-bit overflow.
    #[must_use]
    pub fn amount_msats(invoice: &str) -> Option<u64> {
        let invoice = invoice.trim().to_ascii_lowercase();
        let separator = invoice.rfind('1')?;
        let hrp = invoice.get(..separator)?;
        let rest = hrp.strip_prefix("ln")?;

        let currency_len = rest
            .bytes()
            .take_while(|byte| byte.is_ascii_lowercase())
            .count();
        if currency_len == 0 {
            return None;
        }
        let amount_part = rest.get(currency_len..)?;

        let digits_len = amount_part
            .bytes()
            .take_while(|byte| byte.is_ascii_digit())
            .count();
        if digits_len == 0 {
            return None;
        }
        let amount = amount_part.get(..digits_len)?.parse::<u64>().ok()?;

        match amount_part.get(digits_len..)? {
            "" => amount.checked_mul(100_000_000_000),
            "m" => amount.checked_mul(100_000_000),
            "u" => amount.checked_mul(100_000),
            "n" => amount.checked_mul(100),
            "p" => {
                if amount % 10 != 0 {
                    return None;
                }
                Some(amount / 10)
            }
            _ => None,
        }
    }
}
