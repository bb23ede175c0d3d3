//! The composed (crc32, md5) digest used for preprocessor output and
//! compiler argv signatures.
//!
//! The CRC is a cheap pre-filter: equality checks compare it first and only
//! touch the MD5 on a CRC match. A collision merely causes a wrong cache hit,
//! which the byte-level output comparison catches on the next real change.

use std::fmt;
use std::str::FromStr;

use md5::{Digest as _, Md5};

use eyre::{bail, eyre, Result};

/// Feed the hashers in smallish chunks to stay cache-friendly on huge
/// preprocessor outputs.
const UPDATE_CHUNK: usize = 128 * 1024;

/// Streaming digest context.
pub struct DigestHasher {
    crc: crc32fast::Hasher,
    md5: Md5,
}

impl DigestHasher {
    pub fn new() -> DigestHasher {
        DigestHasher {
            crc: crc32fast::Hasher::new(),
            md5: Md5::new(),
        }
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = bytes.len().min(UPDATE_CHUNK);
            self.crc.update(&bytes[..n]);
            self.md5.update(&bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    pub fn finalize(self) -> Digest {
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&self.md5.finalize());
        Digest {
            crc32: self.crc.finalize(),
            md5,
        }
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        DigestHasher::new()
    }
}

/// A 4-byte CRC-32 plus a 16-byte MD5.
#[derive(Clone, Copy, Eq, Debug)]
pub struct Digest {
    crc32: u32,
    md5: [u8; 16],
}

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = DigestHasher::new();
        hasher.update(bytes);
        hasher.finalize()
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Digest) -> bool {
        // crc32 first; it settles almost every comparison.
        self.crc32 == other.crc32 && self.md5 == other.md5
    }
}

impl fmt::Display for Digest {
    /// Canonical text form: `%#x`-style crc32, a colon, 32 hex digits of md5.
    /// This is the exact byte layout the entry and index files have always
    /// used, including the quirk that a zero crc prints as `0`, not `0x0`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.crc32 == 0 {
            write!(f, "0:")?;
        } else {
            write!(f, "{:#x}:", self.crc32)?;
        }
        for b in &self.md5 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Digest> {
        let s = s.trim();
        let (crc_text, md5_text) = s
            .split_once(':')
            .ok_or_else(|| eyre!("digest has no ':' separator: {s:?}"))?;
        let crc_text = crc_text
            .strip_prefix("0x")
            .or_else(|| crc_text.strip_prefix("0X"))
            .unwrap_or(crc_text);
        let crc32 = u32::from_str_radix(crc_text, 16)
            .map_err(|_| eyre!("bad crc32 in digest: {s:?}"))?;

        if md5_text.len() != 32 {
            bail!("bad md5 length in digest: {s:?}");
        }
        let mut md5 = [0u8; 16];
        for (i, byte) in md5.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&md5_text[i * 2..i * 2 + 2], 16)
                .map_err(|_| eyre!("bad md5 hex in digest: {s:?}"))?;
        }

        Ok(Digest { crc32, md5 })
    }
}

/// An insertion-ordered set of digests that are all considered equivalent
/// for cache-hit purposes. The chain grows when a byte-level comparison
/// proves two differing preprocessor outputs compile identically.
#[derive(Clone, Debug, Default)]
pub struct DigestChain {
    sums: Vec<Digest>,
}

impl DigestChain {
    pub fn new() -> DigestChain {
        DigestChain::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn first(&self) -> Option<&Digest> {
        self.sums.first()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.sums.iter().any(|d| d == digest)
    }

    /// Append, keeping the chain duplicate-free.
    pub fn add(&mut self, digest: Digest) {
        if !self.contains(&digest) {
            self.sums.push(digest);
        }
    }

    /// Splice another chain in, preserving insertion order and uniqueness.
    pub fn merge(&mut self, other: &DigestChain) {
        for digest in &other.sums {
            self.add(*digest);
        }
    }

    /// Do the two chains share at least one digest?
    pub fn intersects(&self, other: &DigestChain) -> bool {
        self.sums.iter().any(|d| other.contains(d))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.sums.iter()
    }

    pub fn clear(&mut self) {
        self.sums.clear();
    }
}
