//! Time-based one-time codes

use hmac::{Hmac, Mac};
use rand::Rng;
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::{Sha256, Sha512};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Symbols used for secrets and challenges (RFC 4648 base32 alphabet)
pub const SECRET_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Default secret length in symbols
pub const DEFAULT_SECRET_LENGTH: usize = 64;

/// Largest supported code length
pub const MAX_DIGITS: u32 = 30;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TotpError {
    #[error("Truncation window {offset}+{truncate_bytes} exceeds digest length {digest_len}")]
    TruncationOutOfBounds {
        offset: usize,
        truncate_bytes: usize,
        digest_len: usize,
    },

    #[error("Invalid code length: {0} digits (max: {MAX_DIGITS})")]
    InvalidDigits(u32),

    #[error("Time step must be non-zero")]
    InvalidTimeStep,

    #[error("Invalid HMAC key")]
    InvalidKey,
}

/// HMAC digest used to derive codes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    #[default]
    Sha512,
}

/// TOTP parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TotpConfig {
    /// HMAC digest
    #[serde(default)]
    pub algorithm: DigestAlgorithm,

    /// Step length in seconds
    #[serde(default = "default_time_step")]
    pub time_step: u64,

    /// Bytes taken from the digest at the dynamic offset
    #[serde(default = "default_truncate_bytes")]
    pub truncate_bytes: usize,

    /// Output code length
    #[serde(default = "default_digits")]
    pub digits: u32,

    /// Steps accepted on either side of the current one
    #[serde(default = "default_skew_steps")]
    pub skew_steps: u64,
}

fn default_time_step() -> u64 {
    30
}

fn default_truncate_bytes() -> usize {
    4
}

fn default_digits() -> u32 {
    6
}

fn default_skew_steps() -> u64 {
    1
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::default(),
            time_step: default_time_step(),
            truncate_bytes: default_truncate_bytes(),
            digits: default_digits(),
            skew_steps: default_skew_steps(),
        }
    }
}

/// TOTP code generator and verifier
#[derive(Debug, Clone)]
pub struct TotpEngine {
    config: TotpConfig,
}

impl TotpEngine {
    /// Create an engine, rejecting parameters that cannot produce a code
    pub fn new(config: TotpConfig) -> Result<Self, TotpError> {
        if config.time_step == 0 {
            return Err(TotpError::InvalidTimeStep);
        }
        if config.digits == 0 || config.digits > MAX_DIGITS {
            return Err(TotpError::InvalidDigits(config.digits));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// Counter for the step containing `unix_secs`
    pub fn counter_at(&self, unix_secs: u64) -> u64 {
        unix_secs / self.config.time_step
    }

    /// Largest accepted distance between a peer timestamp and local time
    pub fn tolerance_secs(&self) -> u64 {
        self.config.time_step.saturating_mul(self.config.skew_steps)
    }

    /// Compute the code for an explicit counter
    pub fn code_for_counter(&self, secret: &[u8], counter: u64) -> Result<String, TotpError> {
        let digest = self.hmac(secret, &counter.to_be_bytes())?;

        // Dynamic truncation: offset from the low nibble of the last byte
        let offset = (digest[digest.len() - 1] & 0x0F) as usize;
        let truncate_bytes = self.config.truncate_bytes;
        if offset + truncate_bytes > digest.len() {
            return Err(TotpError::TruncationOutOfBounds {
                offset,
                truncate_bytes,
                digest_len: digest.len(),
            });
        }

        // Reduce while accumulating so any window width fits in a u128
        let modulus = 10u128.pow(self.config.digits);
        let value = digest[offset..offset + truncate_bytes]
            .iter()
            .fold(0u128, |acc, &b| ((acc << 8) | b as u128) % modulus);

        Ok(format!(
            "{:0width$}",
            value,
            width = self.config.digits as usize
        ))
    }

    /// Compute the code for the step containing `unix_secs`
    pub fn code_at(&self, secret: &[u8], unix_secs: u64) -> Result<String, TotpError> {
        self.code_for_counter(secret, self.counter_at(unix_secs))
    }

    /// Compute the code for the current wall-clock step
    pub fn compute_code(&self, secret: &[u8]) -> Result<String, TotpError> {
        self.code_at(secret, unix_now())
    }

    /// Check `candidate` against the step containing `unix_secs` and its neighbours
    pub fn verify_code_at(&self, secret: &[u8], candidate: &str, unix_secs: u64) -> bool {
        self.candidate_counters(unix_secs).any(|counter| {
            self.code_for_counter(secret, counter)
                .map(|code| constant_time_eq(code.as_bytes(), candidate.as_bytes()))
                .unwrap_or(false)
        })
    }

    /// Check `candidate` against the current wall-clock step and its neighbours
    pub fn verify_code(&self, secret: &[u8], candidate: &str) -> bool {
        self.verify_code_at(secret, candidate, unix_now())
    }

    /// Counters within the skew window around `unix_secs`, current step first
    pub fn candidate_counters(&self, unix_secs: u64) -> impl Iterator<Item = u64> {
        let current = self.counter_at(unix_secs);
        let skew = self.config.skew_steps;
        std::iter::once(current).chain((1..=skew).flat_map(move |d| {
            [current.checked_sub(d), current.checked_add(d)]
                .into_iter()
                .flatten()
        }))
    }

    fn hmac(&self, secret: &[u8], message: &[u8]) -> Result<Vec<u8>, TotpError> {
        match self.config.algorithm {
            DigestAlgorithm::Sha256 => {
                let mut mac =
                    HmacSha256::new_from_slice(secret).map_err(|_| TotpError::InvalidKey)?;
                mac.update(message);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            DigestAlgorithm::Sha512 => {
                let mut mac =
                    HmacSha512::new_from_slice(secret).map_err(|_| TotpError::InvalidKey)?;
                mac.update(message);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }
}

/// Generate a shared secret from the OS random source
pub fn generate_secret(length: usize) -> String {
    random_symbols(length)
}

/// Generate a challenge string from the OS random source
pub fn generate_challenge(length: usize) -> String {
    random_symbols(length)
}

fn random_symbols(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| SECRET_ALPHABET[rng.gen_range(0..SECRET_ALPHABET.len())] as char)
        .collect()
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
