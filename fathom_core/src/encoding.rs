//! Text encodings supported by String elements.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringEncoding {
    #[default]
    Ascii,
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("String contains invalid {0} bytes.")]
    InvalidBytes(&'static str),
    #[error("'{0}' cannot be represented in {1}")]
    Unrepresentable(char, &'static str),
}

impl StringEncoding {
    pub fn label(self) -> &'static str {
        match self {
            StringEncoding::Ascii => "ASCII",
            StringEncoding::Utf8 => "UTF8",
            StringEncoding::Utf16Le => "UTF16",
            StringEncoding::Utf16Be => "UTF16BE",
            StringEncoding::Utf32Le => "UTF32",
            StringEncoding::Utf32Be => "UTF32BE",
        }
    }

    /// Size of one code unit in bytes.
    pub fn unit_bytes(self) -> usize {
        match self {
            StringEncoding::Ascii | StringEncoding::Utf8 => 1,
            StringEncoding::Utf16Le | StringEncoding::Utf16Be => 2,
            StringEncoding::Utf32Le | StringEncoding::Utf32Be => 4,
        }
    }

    /// Encodings where every character has the same width, so a character count converts
    /// directly to a bit length.
    pub fn fixed_char_bytes(self) -> Option<usize> {
        match self {
            StringEncoding::Ascii => Some(1),
            StringEncoding::Utf32Le | StringEncoding::Utf32Be => Some(4),
            _ => None,
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            StringEncoding::Ascii => text
                .chars()
                .map(|c| {
                    if c.is_ascii() {
                        Ok(c as u8)
                    } else {
                        Err(EncodingError::Unrepresentable(c, self.label()))
                    }
                })
                .collect(),
            StringEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            StringEncoding::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            StringEncoding::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            StringEncoding::Utf32Le => {
                Ok(text.chars().flat_map(|c| u32::from(c).to_le_bytes()).collect())
            }
            StringEncoding::Utf32Be => {
                Ok(text.chars().flat_map(|c| u32::from(c).to_be_bytes()).collect())
            }
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, EncodingError> {
        let invalid = || EncodingError::InvalidBytes(self.label());
        if bytes.len() % self.unit_bytes() != 0 {
            return Err(invalid());
        }
        match self {
            StringEncoding::Ascii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|b| *b as char).collect())
                } else {
                    Err(invalid())
                }
            }
            StringEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| invalid()),
            StringEncoding::Utf16Le | StringEncoding::Utf16Be => {
                let units = bytes.chunks_exact(2).map(|c| {
                    let pair = [c[0], c[1]];
                    if self == StringEncoding::Utf16Le {
                        u16::from_le_bytes(pair)
                    } else {
                        u16::from_be_bytes(pair)
                    }
                });
                char::decode_utf16(units)
                    .collect::<Result<String, _>>()
                    .map_err(|_| invalid())
            }
            StringEncoding::Utf32Le | StringEncoding::Utf32Be => bytes
                .chunks_exact(4)
                .map(|c| {
                    let quad = [c[0], c[1], c[2], c[3]];
                    let code = if self == StringEncoding::Utf32Le {
                        u32::from_le_bytes(quad)
                    } else {
                        u32::from_be_bytes(quad)
                    };
                    char::from_u32(code).ok_or_else(invalid)
                })
                .collect(),
        }
    }

    /// Number of bytes in the character whose first code unit is `unit`.
    pub fn char_width(self, unit: &[u8]) -> Result<usize, EncodingError> {
        let invalid = || EncodingError::InvalidBytes(self.label());
        match self {
            StringEncoding::Ascii => Ok(1),
            StringEncoding::Utf8 => match unit.first().copied().ok_or_else(invalid)? {
                0x00..=0x7f => Ok(1),
                0xc0..=0xdf => Ok(2),
                0xe0..=0xef => Ok(3),
                0xf0..=0xf7 => Ok(4),
                _ => Err(invalid()),
            },
            StringEncoding::Utf16Le | StringEncoding::Utf16Be => {
                let [a, b] = unit else {
                    return Err(invalid());
                };
                let code = if self == StringEncoding::Utf16Le {
                    u16::from_le_bytes([*a, *b])
                } else {
                    u16::from_be_bytes([*a, *b])
                };
                Ok(if (0xd800..=0xdbff).contains(&code) { 4 } else { 2 })
            }
            StringEncoding::Utf32Le | StringEncoding::Utf32Be => Ok(4),
        }
    }

    pub fn terminator(self) -> Vec<u8> {
        vec![0; self.unit_bytes()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_round_trips_surrogate_pairs() {
        let text = "a\u{1F600}";
        let bytes = StringEncoding::Utf16Le.encode(text).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(StringEncoding::Utf16Le.char_width(&bytes[2..4]).unwrap(), 4);
        assert_eq!(StringEncoding::Utf16Le.decode(&bytes).unwrap(), text);
    }

    #[test]
    fn big_endian_variants_differ_from_little() {
        assert_eq!(StringEncoding::Utf16Be.encode("A").unwrap(), vec![0, 0x41]);
        assert_eq!(StringEncoding::Utf32Be.encode("A").unwrap(), vec![0, 0, 0, 0x41]);
        assert_eq!(StringEncoding::Utf32Le.decode(&[0x41, 0, 0, 0]).unwrap(), "A");
    }

    #[test]
    fn invalid_bytes_are_reported_with_encoding_name() {
        assert_eq!(
            StringEncoding::Utf8.decode(&[0xff, 0xfe]),
            Err(EncodingError::InvalidBytes("UTF8"))
        );
        assert_eq!(
            StringEncoding::Ascii.decode(&[0x80]),
            Err(EncodingError::InvalidBytes("ASCII"))
        );
        assert!(StringEncoding::Ascii.encode("é").is_err());
    }

    #[test]
    fn utf8_char_width_follows_lead_byte() {
        let bytes = "é".as_bytes();
        assert_eq!(StringEncoding::Utf8.char_width(&bytes[..1]).unwrap(), 2);
        assert!(StringEncoding::Utf8.char_width(&[0x80]).is_err());
    }
}
