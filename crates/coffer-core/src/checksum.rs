//! Checksums in `{algorithm}:{lowercase-hex}` form and the digests behind them.
//!
//! [`Checksum`] is the textual checksum carried by artifacts and stored
//! objects. Any lowercase algorithm token is representable so checksums
//! produced elsewhere survive a round trip, but only the algorithms in
//! [`DigestAlgorithm`] can be computed locally.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

use crate::error::CofferError;
use crate::Result;

/// A hash algorithm coffer can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256, the default for content and meta checksums.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
    /// MD5, for checksums recorded by older archive sites.
    Md5,
}

impl DigestAlgorithm {
    /// Returns the algorithm identifier used in checksum text.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Md5 => "md5",
        }
    }

    /// Start an incremental digest with this algorithm.
    pub fn digester(&self) -> Digester {
        match self {
            Self::Sha256 => Digester::Sha256(Sha256::new()),
            Self::Sha512 => Digester::Sha512(Sha512::new()),
            Self::Md5 => Digester::Md5(Md5::new()),
        }
    }

    /// Digest a complete buffer in one call.
    pub fn checksum(&self, data: &[u8]) -> Checksum {
        let mut d = self.digester();
        d.update(data);
        d.finish()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CofferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "md5" => Ok(Self::Md5),
            other => Err(CofferError::invalid(format!(
                "unsupported digest algorithm: {other}"
            ))),
        }
    }
}

/// An in-progress digest. Feed bytes with [`update`](Digester::update) and
/// call [`finish`](Digester::finish) once the last byte has been seen.
#[derive(Clone)]
pub enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Md5(h) => h.update(data),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
            Self::Md5(_) => DigestAlgorithm::Md5,
        }
    }

    pub fn finish(self) -> Checksum {
        let algorithm = self.algorithm();
        let hex = match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        };
        Checksum {
            algorithm: algorithm.name().to_string(),
            hex,
        }
    }
}

/// A checksum in `{algorithm}:{lowercase-hex}` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: String,
    hex: String,
}

impl Checksum {
    /// Parse checksum text. The hex part is normalised to lowercase.
    pub fn parse(text: &str) -> Result<Self> {
        let (algorithm, value) = text
            .split_once(':')
            .ok_or_else(|| CofferError::invalid(format!("checksum missing algorithm: {text}")))?;
        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(CofferError::invalid(format!(
                "invalid checksum algorithm: {text}"
            )));
        }
        if value.is_empty() || value.len() % 2 != 0 || !value.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(CofferError::invalid(format!("invalid checksum value: {text}")));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: value.to_ascii_lowercase(),
        })
    }

    /// The algorithm token, e.g. `sha256` or `md5`.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The lowercase hex digest value.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The computable algorithm, if coffer supports this checksum's algorithm.
    pub fn digest_algorithm(&self) -> Option<DigestAlgorithm> {
        self.algorithm.parse().ok()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = CofferError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = CofferError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}
