//! Checksum algorithms accepted on chunk writes.

use crate::errors::{ErrorCode, UploadError, UploadResult};
use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256, Sha512};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 3] = [Self::Md5, Self::Sha256, Self::Sha512];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            Self::Md5 => Hasher::Md5(md5::Context::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(UploadError::with_message(
                ErrorCode::UnsupportedChecksumAlgorithm,
                format!("unsupported checksum algorithm `{other}`"),
            )),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared digest for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Digest as sent by the client, base64 or hex.
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
        }
    }

    /// Parse `<algorithm> <digest>`; a bare digest defaults to `default`.
    pub fn parse(header: &str, default: Option<ChecksumAlgorithm>) -> UploadResult<Self> {
        let mut parts = header.split_whitespace();
        match (parts.next(), parts.next(), default) {
            (Some(alg), Some(value), _) => Ok(Self::new(alg.parse()?, value)),
            (Some(value), None, Some(alg)) => Ok(Self::new(alg, value)),
            _ => Err(UploadError::bad_request(format!(
                "malformed checksum `{header}`"
            ))),
        }
    }

    /// Compare against a computed digest, accepting base64 or hex encodings.
    pub fn matches(&self, digest: &[u8]) -> bool {
        let value = self.value.trim();
        if let Ok(decoded) = general_purpose::STANDARD.decode(value) {
            if decoded == digest {
                return true;
            }
        }
        hex::decode(value).map(|d| d == digest).unwrap_or(false)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.value)
    }
}

/// Streaming digest state.
pub enum Hasher {
    Md5(md5::Context),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Md5(ctx) => ctx.compute().0.to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}
