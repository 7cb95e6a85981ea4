//! Registry value (vk) parsing, serialization, and data extraction.

use crate::cell::ValueType;
use crate::error::{RegistryError, Result};
use crate::utils::{
    encode_utf16_le, read_ascii_string, read_u16_le, read_u32_le, read_utf16_string, write_u16_le,
    write_u32_le,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// High bit of the data-length field: data is stored inline in the
/// data-offset slot instead of in a separate cell.
pub const VK_DATA_INLINE_BIT: u32 = 0x8000_0000;

/// Value name flag: name is stored as ASCII rather than UTF-16LE.
pub const VK_FLAG_COMP_NAME: u16 = 0x0001;

/// Payload offset of the raw data-length field.
pub const VK_DATA_LENGTH_OFFSET: usize = 0x04;

/// Payload offset of the data-offset field.
pub const VK_DATA_OFFSET_OFFSET: usize = 0x08;

/// Payload offset of the type-code field.
pub const VK_TYPE_OFFSET: usize = 0x0C;

/// Offset where the value name begins.
const VK_NAME_OFFSET: usize = 0x14;

/// Value key (vk) structure.
///
/// Represents a registry value with its name, type, and data location. The
/// empty name is legal and denotes the key's default value; it is distinct
/// from "no value".
#[derive(Debug, Clone)]
pub struct ValueKey {
    /// Length of value name.
    pub name_length: u16,

    /// Length of value data (high bit stripped).
    pub data_length: u32,

    /// Data is packed into the data-offset field (high bit of the raw
    /// length field was set).
    pub inline: bool,

    /// Offset to value data (or the inline bytes themselves).
    pub data_offset: u32,

    /// Value data type.
    pub data_type: ValueType,

    /// Flags (0x0001 = name is ASCII).
    pub flags: u16,

    /// Value name.
    pub name: String,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < VK_NAME_OFFSET {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VK_NAME_OFFSET,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"vk" {
            return Err(RegistryError::invalid_signature(b"vk", &data[0..2]));
        }

        let name_length = read_u16_le(data, 0x02)?;

        let data_length_raw = read_u32_le(data, VK_DATA_LENGTH_OFFSET)?;
        let inline = data_length_raw & VK_DATA_INLINE_BIT != 0;
        let data_length = data_length_raw & !VK_DATA_INLINE_BIT;

        let data_offset = read_u32_le(data, VK_DATA_OFFSET_OFFSET)?;
        let data_type = ValueType::from_u32(read_u32_le(data, VK_TYPE_OFFSET)?);
        let flags = read_u16_le(data, 0x10)?;

        // Spare field at 0x12 (2 bytes) - unused

        let name = if name_length > 0 {
            let name_end = VK_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[VK_NAME_OFFSET..name_end];

            if (flags & VK_FLAG_COMP_NAME) != 0 {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            // Unnamed: the key's default value.
            String::new()
        };

        Ok(ValueKey {
            name_length,
            data_length,
            inline,
            data_offset,
            data_type,
            flags,
            name,
        })
    }

    /// Serializes a fresh value key payload.
    ///
    /// `data_length_raw` carries the inline bit when the data is packed
    /// into `data_offset`.
    pub fn encode_new(
        name: &str,
        data_type: ValueType,
        data_length_raw: u32,
        data_offset: u32,
    ) -> Result<Vec<u8>> {
        let compressed = name.is_ascii();
        let name_bytes = if compressed {
            name.as_bytes().to_vec()
        } else {
            encode_utf16_le(name)
        };

        if name_bytes.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidFormat(format!(
                "Value name too long: {} bytes",
                name_bytes.len()
            )));
        }

        let flags = if compressed { VK_FLAG_COMP_NAME } else { 0 };

        let mut buf = vec![0u8; VK_NAME_OFFSET + name_bytes.len()];
        buf[0..2].copy_from_slice(b"vk");
        write_u16_le(&mut buf, 0x02, name_bytes.len() as u16)?;
        write_u32_le(&mut buf, VK_DATA_LENGTH_OFFSET, data_length_raw)?;
        write_u32_le(&mut buf, VK_DATA_OFFSET_OFFSET, data_offset)?;
        write_u32_le(&mut buf, VK_TYPE_OFFSET, data_type.as_u32())?;
        write_u16_le(&mut buf, 0x10, flags)?;
        buf[VK_NAME_OFFSET..].copy_from_slice(&name_bytes);

        Ok(buf)
    }

    /// Returns true if the data is stored inline (in the data_offset field).
    pub fn is_inline_data(&self) -> bool {
        self.inline
    }

    /// Extracts inline data (at most 4 bytes packed into the offset field).
    pub fn inline_data(&self) -> Vec<u8> {
        let bytes = self.data_offset.to_le_bytes();
        let len = (self.data_length as usize).min(4);
        bytes[..len].to_vec()
    }
}

/// Parsed registry value data.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ValueData {
    /// No data.
    None,

    /// String value.
    String(String),

    /// Expandable string value.
    ExpandString(String),

    /// Binary data.
    Binary(Vec<u8>),

    /// 32-bit integer.
    Dword(u32),

    /// 32-bit big-endian integer.
    DwordBigEndian(u32),

    /// Multiple strings.
    MultiString(Vec<String>),

    /// 64-bit integer.
    Qword(u64),

    /// Unknown or unsupported type.
    Unknown(Vec<u8>),
}

impl ValueData {
    /// Parses value data based on the value type.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw value data bytes.
    /// * `value_type` - Type of the value.
    /// * `offset` - Offset for error reporting.
    pub fn parse(data: &[u8], value_type: ValueType, offset: u32) -> Result<Self> {
        if data.is_empty() {
            return Ok(ValueData::None);
        }

        match value_type {
            ValueType::None => Ok(ValueData::None),

            ValueType::String | ValueType::ExpandString => {
                let s = read_utf16_string(data, offset)?;
                if value_type == ValueType::String {
                    Ok(ValueData::String(s))
                } else {
                    Ok(ValueData::ExpandString(s))
                }
            }

            ValueType::Binary => Ok(ValueData::Binary(data.to_vec())),

            ValueType::Dword => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Dword(cursor.read_u32::<LittleEndian>()?))
            }

            ValueType::DwordBigEndian => {
                if data.len() < 4 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 4,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::DwordBigEndian(cursor.read_u32::<BigEndian>()?))
            }

            ValueType::Qword => {
                if data.len() < 8 {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: 8,
                        actual: data.len(),
                    });
                }
                let mut cursor = Cursor::new(data);
                Ok(ValueData::Qword(cursor.read_u64::<LittleEndian>()?))
            }

            ValueType::MultiString => {
                let full_string = read_utf16_string(data, offset)?;
                let strings: Vec<String> = full_string
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Ok(ValueData::MultiString(strings))
            }

            // For other types, return raw binary data
            _ => Ok(ValueData::Unknown(data.to_vec())),
        }
    }

    /// Serializes this value into the raw bytes a vk cell stores.
    ///
    /// The inverse of [`ValueData::parse`] for the common types; used by
    /// callers that build values from typed data rather than raw bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ValueData::None => Vec::new(),
            ValueData::String(s) | ValueData::ExpandString(s) => {
                let mut bytes = encode_utf16_le(s);
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
            ValueData::Binary(b) | ValueData::Unknown(b) => b.clone(),
            ValueData::Dword(d) => d.to_le_bytes().to_vec(),
            ValueData::DwordBigEndian(d) => d.to_be_bytes().to_vec(),
            ValueData::Qword(q) => q.to_le_bytes().to_vec(),
            ValueData::MultiString(strings) => {
                let mut bytes = Vec::new();
                for s in strings {
                    bytes.extend_from_slice(&encode_utf16_le(s));
                    bytes.extend_from_slice(&[0, 0]);
                }
                bytes.extend_from_slice(&[0, 0]);
                bytes
            }
        }
    }

    /// Converts the value data to a string representation.
    pub fn render(&self) -> String {
        match self {
            ValueData::None => String::from("(none)"),
            ValueData::String(s) | ValueData::ExpandString(s) => s.clone(),
            ValueData::Binary(b) | ValueData::Unknown(b) => hex::encode(b),
            ValueData::Dword(d) => format!("{} (0x{:08X})", d, d),
            ValueData::DwordBigEndian(d) => format!("{} (0x{:08X})", d, d),
            ValueData::Qword(q) => format!("{} (0x{:016X})", q, q),
            ValueData::MultiString(strings) => strings.join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_key_minimum_size() {
        let data = vec![0u8; 19];
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_key_invalid_signature() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(b"XX");
        let result = ValueKey::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_data() {
        let payload = ValueKey::encode_new(
            "Flags",
            ValueType::Dword,
            4 | VK_DATA_INLINE_BIT,
            u32::from_le_bytes([0x01, 0x02, 0x03, 0x04]),
        )
        .unwrap();

        let vk = ValueKey::parse(&payload, 0).unwrap();
        assert!(vk.is_inline_data());
        assert_eq!(vk.data_length, 4);
        assert_eq!(vk.inline_data(), vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(vk.name, "Flags");
    }

    #[test]
    fn test_empty_name_is_default_value() {
        let payload = ValueKey::encode_new("", ValueType::String, 0, 0).unwrap();
        let vk = ValueKey::parse(&payload, 0).unwrap();
        assert_eq!(vk.name, "");
        assert_eq!(vk.name_length, 0);
    }

    #[test]
    fn test_value_data_string_round_trip() {
        let encoded = ValueData::String("C:\\Windows".into()).encode();
        let parsed = ValueData::parse(&encoded, ValueType::String, 0).unwrap();
        assert_eq!(parsed, ValueData::String("C:\\Windows".into()));
    }

    #[test]
    fn test_value_data_multi_string_round_trip() {
        let original = ValueData::MultiString(vec!["alpha".into(), "beta".into()]);
        let parsed = ValueData::parse(&original.encode(), ValueType::MultiString, 0).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_value_data_dword() {
        let parsed = ValueData::parse(&0xDEADBEEFu32.to_le_bytes(), ValueType::Dword, 0).unwrap();
        assert_eq!(parsed, ValueData::Dword(0xDEADBEEF));
        assert_eq!(parsed.render(), "3735928559 (0xDEADBEEF)");
    }
}
