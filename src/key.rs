//! Registry key node (nk) parsing and serialization.

use crate::cell::KeyNodeFlags;
use crate::error::{RegistryError, Result};
use crate::utils::{
    encode_utf16_le, read_ascii_string, read_u16_le, read_u32_le, read_utf16_string, write_u16_le,
    write_u32_le, write_u64_le, NONE_OFFSET,
};

/// Minimum size of a key node structure in bytes.
pub const KEY_NODE_MIN_SIZE: usize = 76;

/// Offset of the key name in the key node structure.
const KEY_NAME_OFFSET: usize = 0x4C;

/// Payload offset of the last-written FILETIME.
pub const NK_TIMESTAMP_OFFSET: usize = 0x04;

/// Payload offset of the parent key offset.
pub const NK_PARENT_OFFSET: usize = 0x10;

/// Payload offset of the subkey count.
pub const NK_SUBKEY_COUNT_OFFSET: usize = 0x14;

/// Payload offset of the subkey list offset.
pub const NK_SUBKEY_LIST_OFFSET: usize = 0x1C;

/// Payload offset of the value count.
pub const NK_VALUE_COUNT_OFFSET: usize = 0x24;

/// Payload offset of the value list offset.
pub const NK_VALUE_LIST_OFFSET: usize = 0x28;

/// Payload offset of the security cell offset.
pub const NK_SECURITY_OFFSET: usize = 0x2C;

/// Payload offset of the class name cell offset.
pub const NK_CLASS_OFFSET: usize = 0x30;

/// Payload offset of the maximum subkey name length field.
pub const NK_MAX_SUBKEY_NAME_OFFSET: usize = 0x34;

/// Payload offset of the maximum value name length field.
pub const NK_MAX_VALUE_NAME_OFFSET: usize = 0x3C;

/// Payload offset of the maximum value data length field.
pub const NK_MAX_VALUE_DATA_OFFSET: usize = 0x40;

/// Key node (nk) structure.
///
/// Represents a registry key with metadata including name, timestamps,
/// and references to subkeys and values.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Access bits (unused).
    pub access_bits: u32,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name.
    pub max_subkey_name_len: u32,

    /// Maximum length of subkey class name.
    pub max_subkey_class_len: u32,

    /// Maximum length of value name.
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Work variable (unused).
    pub work_var: u32,

    /// Length of key name.
    pub name_length: u16,

    /// Length of class name.
    pub class_name_length: u16,

    /// Key name.
    pub name: String,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"nk" {
            return Err(RegistryError::invalid_signature(b"nk", &data[0..2]));
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, 0x02)?);

        let last_written = u64::from(read_u32_le(data, 0x04)?)
            | (u64::from(read_u32_le(data, 0x08)?) << 32);

        let access_bits = read_u32_le(data, 0x0C)?;
        let parent_offset = read_u32_le(data, NK_PARENT_OFFSET)?;
        let subkey_count = read_u32_le(data, NK_SUBKEY_COUNT_OFFSET)?;
        let volatile_subkey_count = read_u32_le(data, 0x18)?;
        let subkey_list_offset = read_u32_le(data, NK_SUBKEY_LIST_OFFSET)?;
        let volatile_subkey_list_offset = read_u32_le(data, 0x20)?;
        let value_count = read_u32_le(data, NK_VALUE_COUNT_OFFSET)?;
        let value_list_offset = read_u32_le(data, NK_VALUE_LIST_OFFSET)?;
        let security_offset = read_u32_le(data, NK_SECURITY_OFFSET)?;
        let class_name_offset = read_u32_le(data, NK_CLASS_OFFSET)?;

        let max_subkey_name_len = read_u32_le(data, NK_MAX_SUBKEY_NAME_OFFSET)?;
        let max_subkey_class_len = read_u32_le(data, 0x38)?;
        let max_value_name_len = read_u32_le(data, NK_MAX_VALUE_NAME_OFFSET)?;
        let max_value_data_len = read_u32_le(data, NK_MAX_VALUE_DATA_OFFSET)?;
        let work_var = read_u32_le(data, 0x44)?;

        let name_length = read_u16_le(data, 0x48)?;
        let class_name_length = read_u16_le(data, 0x4A)?;

        let name = if name_length > 0 {
            let name_end = KEY_NAME_OFFSET + name_length as usize;
            if name_end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: name_end,
                    actual: data.len(),
                });
            }

            let name_data = &data[KEY_NAME_OFFSET..name_end];

            if flags.is_compressed() {
                read_ascii_string(name_data)
            } else {
                read_utf16_string(name_data, offset)?
            }
        } else {
            String::new()
        };

        Ok(KeyNode {
            flags,
            last_written,
            access_bits,
            parent_offset,
            subkey_count,
            volatile_subkey_count,
            subkey_list_offset,
            volatile_subkey_list_offset,
            value_count,
            value_list_offset,
            security_offset,
            class_name_offset,
            max_subkey_name_len,
            max_subkey_class_len,
            max_value_name_len,
            max_value_data_len,
            work_var,
            name_length,
            class_name_length,
            name,
        })
    }

    /// Serializes a fresh key node payload for a key with no subkeys, no
    /// values, and no class name.
    ///
    /// ASCII names are stored compressed (one byte per character, flag bit
    /// set); other names are stored as UTF-16LE.
    pub fn encode_new(
        name: &str,
        parent_offset: u32,
        security_offset: u32,
        extra_flags: u16,
        timestamp: u64,
    ) -> Result<Vec<u8>> {
        let compressed = name.is_ascii();
        let name_bytes = if compressed {
            name.as_bytes().to_vec()
        } else {
            encode_utf16_le(name)
        };

        if name_bytes.len() > u16::MAX as usize {
            return Err(RegistryError::InvalidFormat(format!(
                "Key name too long: {} bytes",
                name_bytes.len()
            )));
        }

        let mut flags = extra_flags;
        if compressed {
            flags |= KeyNodeFlags::COMP_NAME;
        }

        let mut buf = vec![0u8; KEY_NAME_OFFSET + name_bytes.len()];
        buf[0..2].copy_from_slice(b"nk");
        write_u16_le(&mut buf, 0x02, flags)?;
        write_u64_le(&mut buf, NK_TIMESTAMP_OFFSET, timestamp)?;
        write_u32_le(&mut buf, NK_PARENT_OFFSET, parent_offset)?;
        write_u32_le(&mut buf, NK_SUBKEY_COUNT_OFFSET, 0)?;
        write_u32_le(&mut buf, NK_SUBKEY_LIST_OFFSET, NONE_OFFSET)?;
        write_u32_le(&mut buf, 0x20, NONE_OFFSET)?; // volatile subkey list
        write_u32_le(&mut buf, NK_VALUE_COUNT_OFFSET, 0)?;
        write_u32_le(&mut buf, NK_VALUE_LIST_OFFSET, NONE_OFFSET)?;
        write_u32_le(&mut buf, NK_SECURITY_OFFSET, security_offset)?;
        write_u32_le(&mut buf, NK_CLASS_OFFSET, NONE_OFFSET)?;
        write_u16_le(&mut buf, 0x48, name_bytes.len() as u16)?;
        buf[KEY_NAME_OFFSET..].copy_from_slice(&name_bytes);

        Ok(buf)
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_node_minimum_size() {
        let data = vec![0u8; 75];
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_node_invalid_signature() {
        let mut data = vec![0u8; 80];
        data[0..2].copy_from_slice(b"XX");
        let result = KeyNode::parse(&data, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_ascii_round_trip() {
        let payload = KeyNode::encode_new("Software", 0x20, 0x80, 0, 1234).unwrap();
        let nk = KeyNode::parse(&payload, 0).unwrap();

        assert_eq!(nk.name, "Software");
        assert!(nk.flags.is_compressed());
        assert_eq!(nk.parent_offset, 0x20);
        assert_eq!(nk.security_offset, 0x80);
        assert_eq!(nk.last_written, 1234);
        assert_eq!(nk.subkey_count, 0);
        assert_eq!(nk.subkey_list_offset, NONE_OFFSET);
        assert_eq!(nk.value_count, 0);
        assert_eq!(nk.value_list_offset, NONE_OFFSET);
    }

    #[test]
    fn test_encode_unicode_round_trip() {
        let payload = KeyNode::encode_new("Schlüssel", 0, NONE_OFFSET, 0, 0).unwrap();
        let nk = KeyNode::parse(&payload, 0).unwrap();

        assert_eq!(nk.name, "Schlüssel");
        assert!(!nk.flags.is_compressed());
    }
}
