//! Checksums an element carries over another element's rendered bytes.
//!
//! Fixups only run during generation, next to relation recomputation. When the checksum
//! element lies inside the region it covers, its own bytes are zeroed before summing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixupKind {
    /// CRC-32 (IEEE 802.3, reflected).
    Crc32,
    /// Sum of all bytes, modulo 256.
    Sum8,
    /// Ones' complement of the ones' complement sum of big-endian 16-bit words (RFC 1071).
    Internet,
    /// ISO 8473 Fletcher checksum (RFC 1008, 7.2.1). The checksum bytes must lie inside the
    /// region.
    IsoFletcher16,
    /// MD5 digest of the region, carried by a 16-byte blob.
    Md5,
}

impl FixupKind {
    /// Bits a number subject needs to hold the result; `None` for digests carried by a blob.
    pub fn width(self) -> Option<u32> {
        match self {
            FixupKind::Crc32 => Some(32),
            FixupKind::Sum8 => Some(8),
            FixupKind::Internet | FixupKind::IsoFletcher16 => Some(16),
            FixupKind::Md5 => None,
        }
    }

    /// Computes the fixup over `data`. `offset` is where the subject's bytes sit inside
    /// `data`, when they do.
    pub fn compute(self, data: &[u8], offset: Option<usize>) -> FixupValue {
        match self {
            FixupKind::Crc32 => FixupValue::Number(u64::from(crc32(data))),
            FixupKind::Sum8 => {
                FixupValue::Number(u64::from(data.iter().fold(0u8, |s, b| s.wrapping_add(*b))))
            }
            FixupKind::Internet => FixupValue::Number(u64::from(internet(data))),
            FixupKind::IsoFletcher16 => {
                FixupValue::Number(u64::from(iso_fletcher16(data, offset.unwrap_or(0))))
            }
            FixupKind::Md5 => FixupValue::Digest(md5::compute(data).0.to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupValue {
    Number(u64),
    Digest(Vec<u8>),
}

/// A checksum carried by the element it is attached to. `of` names the covered element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Fixup {
    pub kind: FixupKind,
    pub of: String,
}

impl Fixup {
    pub fn new(kind: FixupKind, of: &str) -> Self {
        Self {
            kind,
            of: of.to_string(),
        }
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in data {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

fn internet(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| (u32::from(pair[0]) << 8) | u32::from(pair.get(1).copied().unwrap_or(0)))
        .fold(0u32, |s, word| s.wrapping_add(word));
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn iso_fletcher16(data: &[u8], offset: usize) -> u16 {
    let (mut c0, mut c1) = (0i64, 0i64);
    for (i, byte) in data.iter().enumerate() {
        let b = if i == offset || i == offset + 1 { 0 } else { i64::from(*byte) };
        c0 = (c0 + b) % 255;
        c1 = (c1 + c0) % 255;
    }
    let len = data.len() as i64;
    let mut x = ((len - offset as i64 - 1) * c0 - c1) % 255;
    if x <= 0 {
        x += 255;
    }
    let mut y = 510 - c0 - x;
    if y > 255 {
        y -= 255;
    }
    ((x << 8) | (y & 0xff)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_the_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn internet_checksum_of_an_ipv4_header() {
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet(&header), 0xb861);
        assert_eq!(internet(&[0xff]), 0x00ff, "odd lengths pad with a zero byte");
    }

    #[test]
    fn fletcher_makes_the_region_verify() {
        let mut data = vec![0x01, 0x02, 0x00, 0x00, 0x03, 0x04];
        let sum = iso_fletcher16(&data, 2);
        data[2..4].copy_from_slice(&sum.to_be_bytes());
        let (mut c0, mut c1) = (0u32, 0u32);
        for byte in &data {
            c0 = (c0 + u32::from(*byte)) % 255;
            c1 = (c1 + c0) % 255;
        }
        assert_eq!((c0, c1), (0, 0), "a filled-in region sums to zero");
    }

    #[test]
    fn digests_and_sums() {
        assert_eq!(FixupKind::Sum8.compute(&[0xff, 0x02], None), FixupValue::Number(1));
        let FixupValue::Digest(digest) = FixupKind::Md5.compute(b"", None) else {
            panic!("md5 yields a digest");
        };
        assert_eq!(digest[..4], [0xd4, 0x1d, 0x8c, 0xd9]);
    }
}
