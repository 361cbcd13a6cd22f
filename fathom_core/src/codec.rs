//! Scalar encodings shared by the cracker and the generator.

use crate::bits::{BitBuf, sign_extend};
use crate::encoding::StringEncoding;
use crate::model::{ElementKind, Endian, Length, LengthUnit, Node, NumberDef, StringDef};
use crate::value::Value;

fn swaps(def: &NumberDef) -> bool {
    def.endian == Endian::Little && def.size % 8 == 0 && def.size > 8
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Interprets `raw`, read most-significant bit first, as the number `def` describes.
pub(crate) fn decode_number(def: &NumberDef, raw: u64) -> Value {
    let raw = if swaps(def) {
        raw.swap_bytes() >> (64 - def.size)
    } else {
        raw
    };
    if def.signed {
        Value::Int(sign_extend(raw, def.size))
    } else {
        Value::UInt(raw)
    }
}

/// Renders `value` in `def`'s width and byte order. Out-of-range values wrap to the width.
pub(crate) fn encode_number(def: &NumberDef, value: &Value) -> Result<BitBuf, String> {
    let wide: i128 = match value {
        Value::Int(v) => i128::from(*v),
        Value::UInt(v) => i128::from(*v),
        Value::Str(s) => s
            .trim()
            .trim_end_matches('\0')
            .parse()
            .map_err(|_| format!("'{s}' is not a number"))?,
        Value::Bits(b) => {
            let take = b.len().min(u64::from(def.size));
            i128::from(b.uint_at(0, take as u32))
        }
    };
    let mut raw = (wide as u64) & mask(def.size);
    if swaps(def) {
        raw = raw.swap_bytes() >> (64 - def.size);
    }
    let mut out = BitBuf::new();
    out.push_uint(raw, def.size);
    Ok(out)
}

/// Bit length of a bits or bytes length. Character lengths depend on the encoding.
pub(crate) fn length_bits(length: Length) -> Option<u64> {
    match length.unit {
        LengthUnit::Bits => Some(length.value),
        LengthUnit::Bytes => length.value.checked_mul(8),
        LengthUnit::Chars => None,
    }
}

/// Bit length of a declared length on `kind`, when it is known without reading data.
pub(crate) fn declared_bits(kind: &ElementKind, length: Option<Length>) -> Option<u64> {
    let length = length?;
    match (length.unit, kind) {
        (LengthUnit::Chars, ElementKind::String(def)) => {
            let width = def.encoding.fixed_char_bytes()? as u64;
            length.value.checked_mul(width * 8)
        }
        (LengthUnit::Chars, _) => None,
        _ => length_bits(length),
    }
}

/// Pads with zero bits or cuts `bits` to exactly `target` bits.
pub(crate) fn fit(mut bits: BitBuf, target: u64) -> BitBuf {
    if bits.len() > target {
        bits.truncate(target);
    } else {
        bits.extend(&BitBuf::zeros(target - bits.len()));
    }
    bits
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Str(s)) => s.clone(),
        Some(Value::Bits(b)) => String::from_utf8_lossy(b.as_bytes()).into_owned(),
        Some(other) => other.to_string(),
    }
}

fn encode_text(def: &StringDef, length: Option<Length>, text: &str) -> Result<BitBuf, String> {
    let encode = |text: &str| -> Result<BitBuf, String> {
        def.encoding
            .encode(text)
            .map(BitBuf::from_vec)
            .map_err(|e| e.to_string())
    };
    match length {
        Some(Length {
            value,
            unit: LengthUnit::Chars,
        }) => {
            let mut chars: String = text.chars().take(value as usize).collect();
            let missing = value as usize - chars.chars().count();
            chars.extend(std::iter::repeat_n('\0', missing));
            encode(&chars)
        }
        Some(length) => {
            let target = length_bits(length).unwrap_or(0);
            Ok(fit(encode(text)?, target))
        }
        None => {
            let mut out = encode(text)?;
            if def.null_terminated {
                out.extend_bytes(&def.encoding.terminator());
            }
            Ok(out)
        }
    }
}

/// Renders a scalar with the given value, honoring its declared length.
pub(crate) fn encode_scalar(node: &Node, value: Option<&Value>) -> Result<BitBuf, String> {
    match &node.kind {
        ElementKind::Number(def) => encode_number(def, value.unwrap_or(&Value::UInt(0))),
        ElementKind::String(def) => match value {
            Some(Value::Bits(raw)) => Ok(match declared_bits(&node.kind, node.length) {
                Some(target) => fit(raw.clone(), target),
                None => raw.clone(),
            }),
            other => encode_text(def, node.length, &text_of(other)),
        },
        ElementKind::Blob | ElementKind::Padding(_) => {
            let raw = match value {
                Some(Value::Bits(b)) => b.clone(),
                Some(Value::Str(s)) => BitBuf::from_bytes(s.as_bytes()),
                Some(number) => {
                    let text = number.to_string();
                    BitBuf::from_bytes(text.as_bytes())
                }
                None => BitBuf::new(),
            };
            Ok(match node.length.and_then(length_bits) {
                Some(target) => fit(raw, target),
                None => raw,
            })
        }
        other => Err(format!("{} has no scalar encoding", other.type_name())),
    }
}

/// The bit pattern a token element must match.
pub(crate) fn token_literal(node: &Node) -> Result<BitBuf, String> {
    if node.value.is_none() {
        return Err(format!("token '{}' has no value", node.name));
    }
    encode_scalar(node, node.value.as_ref())
}

/// Strips one trailing terminator from bytes read for a null-terminated string.
pub(crate) fn strip_terminator(encoding: StringEncoding, mut bytes: Vec<u8>) -> Vec<u8> {
    let terminator = encoding.terminator();
    if bytes.len() >= terminator.len() && bytes.ends_with(&terminator) {
        bytes.truncate(bytes.len() - terminator.len());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(size: u32, signed: bool, endian: Endian) -> NumberDef {
        NumberDef {
            size,
            signed,
            endian,
        }
    }

    #[test]
    fn little_endian_swaps_whole_bytes_only() {
        let le16 = number(16, false, Endian::Little);
        assert_eq!(decode_number(&le16, 0x0102), Value::UInt(0x0201));
        assert_eq!(
            encode_number(&le16, &Value::UInt(0x0201)).unwrap().as_bytes(),
            &[0x02, 0x01]
        );
        let odd = number(12, false, Endian::Little);
        assert_eq!(decode_number(&odd, 0xabc), Value::UInt(0xabc), "12-bit values keep bit order");
    }

    #[test]
    fn signed_numbers_wrap_to_width() {
        let s8 = number(8, true, Endian::Big);
        assert_eq!(decode_number(&s8, 0xff), Value::Int(-1));
        assert_eq!(encode_number(&s8, &Value::Int(-2)).unwrap().as_bytes(), &[0xfe]);
        assert_eq!(encode_number(&s8, &Value::Int(257)).unwrap().as_bytes(), &[0x01]);
        assert!(encode_number(&s8, &Value::Str("nope".into())).is_err());
    }

    #[test]
    fn strings_fit_their_declared_length() {
        let mut node = Node::new(
            "s",
            ElementKind::String(StringDef {
                encoding: StringEncoding::Ascii,
                null_terminated: false,
            }),
        );
        node.length = Some(Length::bytes(4));
        let out = encode_scalar(&node, Some(&Value::Str("ab".into()))).unwrap();
        assert_eq!(out.as_bytes(), b"ab\0\0");
        let out = encode_scalar(&node, Some(&Value::Str("abcdef".into()))).unwrap();
        assert_eq!(out.as_bytes(), b"abcd");

        node.length = Some(Length::chars(3));
        node.kind = ElementKind::String(StringDef {
            encoding: StringEncoding::Utf16Le,
            null_terminated: false,
        });
        let out = encode_scalar(&node, Some(&Value::Str("a".into()))).unwrap();
        assert_eq!(out.as_bytes(), &[b'a', 0, 0, 0, 0, 0]);
    }

    #[test]
    fn null_terminated_strings_gain_a_terminator() {
        let node = Node::new(
            "s",
            ElementKind::String(StringDef {
                encoding: StringEncoding::Ascii,
                null_terminated: true,
            }),
        );
        let out = encode_scalar(&node, Some(&Value::Str("hi".into()))).unwrap();
        assert_eq!(out.as_bytes(), b"hi\0");
        assert_eq!(strip_terminator(StringEncoding::Ascii, b"hi\0".to_vec()), b"hi");
    }

    #[test]
    fn declared_chars_on_fixed_width_encodings_are_known() {
        let kind = ElementKind::String(StringDef {
            encoding: StringEncoding::Utf32Be,
            null_terminated: false,
        });
        assert_eq!(declared_bits(&kind, Some(Length::chars(2))), Some(64));
        let utf8 = ElementKind::String(StringDef {
            encoding: StringEncoding::Utf8,
            null_terminated: false,
        });
        assert_eq!(declared_bits(&utf8, Some(Length::chars(2))), None);
        assert_eq!(declared_bits(&ElementKind::Blob, Some(Length::bits(3))), Some(3));
    }
}
