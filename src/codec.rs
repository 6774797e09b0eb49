//! Encoding and decoding of characteristic payloads.

use crate::characteristic::Kind;
use crate::error::DecodeError;

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    UInt8(u8),
    Bytes(Vec<u8>),
    MacAddress(String),
}

/// Decode `bytes` according to the layout of `kind`.
pub fn decode(kind: Kind, bytes: &[u8]) -> Result<Value, DecodeError> {
    match kind {
        Kind::Utf8String => decode_utf8(bytes).map(Value::Text),
        Kind::UInt8 => decode_u8(bytes).map(Value::UInt8),
        Kind::FixedBytes(len) => decode_fixed(bytes, len).map(|b| Value::Bytes(b.to_vec())),
        Kind::MacAddressBe6 => decode_mac_address(bytes).map(Value::MacAddress),
    }
}

pub fn decode_utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub fn encode_utf8(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

pub fn decode_u8(bytes: &[u8]) -> Result<u8, DecodeError> {
    match bytes {
        [value] => Ok(*value),
        _ => Err(DecodeError::Length { expected: 1, actual: bytes.len() }),
    }
}

pub fn decode_fixed(bytes: &[u8], len: usize) -> Result<&[u8], DecodeError> {
    if bytes.len() != len {
        return Err(DecodeError::Length { expected: len, actual: bytes.len() });
    }
    Ok(bytes)
}

/// The peripheral sends its address least significant octet first; render it
/// the usual way round, e.g. `fb:ec:25:de:1a:92`.
pub fn decode_mac_address(bytes: &[u8]) -> Result<String, DecodeError> {
    let octets = decode_fixed(bytes, 6)?;
    let parts: Vec<String> = octets.iter().rev().map(|b| hex::encode([*b])).collect();
    Ok(parts.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mac_address_reverses_octets() {
        let mac = decode_mac_address(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]).unwrap();
        assert_eq!(mac, "06:05:04:03:02:01");

        let mac = decode_mac_address(&hex::decode("921ade25ecfb").unwrap()).unwrap();
        assert_eq!(mac, "fb:ec:25:de:1a:92");
    }

    #[test]
    fn test_decode_mac_address_wrong_length() {
        let result = decode_mac_address(&[0x01, 0x02, 0x03]);
        assert_eq!(result, Err(DecodeError::Length { expected: 6, actual: 3 }));
    }

    #[test]
    fn test_decode_u8() {
        assert_eq!(decode_u8(&[0xe6]), Ok(230));
        assert_eq!(decode_u8(&[]), Err(DecodeError::Length { expected: 1, actual: 0 }));
        assert_eq!(decode_u8(&[1, 2]), Err(DecodeError::Length { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_utf8(b"Flowtime"), Ok("Flowtime".to_string()));
        assert!(matches!(decode_utf8(&[0x46, 0xff, 0xfe]), Err(DecodeError::InvalidUtf8(_))));
        assert_eq!(encode_utf8("Flowtime"), b"Flowtime".to_vec());
    }

    #[test]
    fn test_decode_by_kind() {
        assert_eq!(decode(Kind::UInt8, &[5]), Ok(Value::UInt8(5)));
        assert_eq!(
            decode(Kind::FixedBytes(3), &[1, 2, 3]),
            Ok(Value::Bytes(vec![1, 2, 3]))
        );
        assert!(decode(Kind::FixedBytes(20), &[1, 2, 3]).is_err());
        assert_eq!(
            decode(Kind::Utf8String, b"1.2.0"),
            Ok(Value::Text("1.2.0".to_string()))
        );
    }
}
