//! Security descriptor (sk) cell parsing and serialization.
//!
//! Security cells are reference-counted and chained into a circular doubly
//! linked list through their flink/blink fields. A list with one member
//! links both fields back to itself. The editor owns refcount maintenance:
//! key creation references the parent's descriptor, key deletion releases
//! it and unlinks the cell once the count reaches zero.

use crate::error::{RegistryError, Result};
use crate::utils::{read_u32_le, write_u16_le, write_u32_le};

/// Payload offset of the forward link.
pub const SK_FLINK_OFFSET: usize = 0x04;

/// Payload offset of the backward link.
pub const SK_BLINK_OFFSET: usize = 0x08;

/// Payload offset of the reference count.
pub const SK_REFCOUNT_OFFSET: usize = 0x0C;

/// Fixed header size before the descriptor bytes.
const SK_HEADER_SIZE: usize = 0x14;

/// Security descriptor (sk) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityCell {
    /// Offset of the next sk cell in the circular list.
    pub flink: u32,

    /// Offset of the previous sk cell in the circular list.
    pub blink: u32,

    /// Number of key nodes referencing this descriptor.
    pub reference_count: u32,

    /// Self-relative NT security descriptor bytes.
    pub descriptor: Vec<u8>,
}

impl SecurityCell {
    /// Parses a security cell from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "sk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < SK_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: SK_HEADER_SIZE,
                actual: data.len(),
            });
        }

        if &data[0..2] != b"sk" {
            return Err(RegistryError::invalid_signature(b"sk", &data[0..2]));
        }

        let flink = read_u32_le(data, SK_FLINK_OFFSET)?;
        let blink = read_u32_le(data, SK_BLINK_OFFSET)?;
        let reference_count = read_u32_le(data, SK_REFCOUNT_OFFSET)?;
        let descriptor_size = read_u32_le(data, 0x10)? as usize;

        let descriptor_end = SK_HEADER_SIZE + descriptor_size;
        if descriptor_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: descriptor_end,
                actual: data.len(),
            });
        }

        Ok(SecurityCell {
            flink,
            blink,
            reference_count,
            descriptor: data[SK_HEADER_SIZE..descriptor_end].to_vec(),
        })
    }

    /// Serializes a security cell payload.
    pub fn encode_new(
        flink: u32,
        blink: u32,
        reference_count: u32,
        descriptor: &[u8],
    ) -> Result<Vec<u8>> {
        if descriptor.len() > u32::MAX as usize {
            return Err(RegistryError::InvalidFormat(
                "Security descriptor too large".to_string(),
            ));
        }

        let mut buf = vec![0u8; SK_HEADER_SIZE + descriptor.len()];
        buf[0..2].copy_from_slice(b"sk");
        write_u16_le(&mut buf, 0x02, 0)?;
        write_u32_le(&mut buf, SK_FLINK_OFFSET, flink)?;
        write_u32_le(&mut buf, SK_BLINK_OFFSET, blink)?;
        write_u32_le(&mut buf, SK_REFCOUNT_OFFSET, reference_count)?;
        write_u32_le(&mut buf, 0x10, descriptor.len() as u32)?;
        buf[SK_HEADER_SIZE..].copy_from_slice(descriptor);

        Ok(buf)
    }

    /// A minimal self-relative security descriptor: revision 1, the
    /// self-relative control bit, and null owner/group/sacl/dacl.
    ///
    /// Used when creating a hive from scratch; real hives copied from a
    /// Windows system carry full descriptors which are preserved verbatim.
    pub fn minimal_descriptor() -> Vec<u8> {
        let mut sd = vec![0u8; 20];
        sd[0] = 1; // revision
        sd[3] = 0x80; // control: SE_SELF_RELATIVE (little-endian u16 at 0x02)
        sd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_cell_round_trip() {
        let descriptor = SecurityCell::minimal_descriptor();
        let payload = SecurityCell::encode_new(0x80, 0x80, 1, &descriptor).unwrap();

        let sk = SecurityCell::parse(&payload, 0).unwrap();
        assert_eq!(sk.flink, 0x80);
        assert_eq!(sk.blink, 0x80);
        assert_eq!(sk.reference_count, 1);
        assert_eq!(sk.descriptor, descriptor);
    }

    #[test]
    fn test_security_cell_truncated() {
        let data = vec![0u8; 10];
        assert!(SecurityCell::parse(&data, 0).is_err());
    }

    #[test]
    fn test_security_cell_bad_signature() {
        let mut data = vec![0u8; 20];
        data[0..2].copy_from_slice(b"nk");
        assert!(SecurityCell::parse(&data, 0).is_err());
    }

    #[test]
    fn test_descriptor_size_respected() {
        // Payload may be padded past the declared descriptor size.
        let mut payload = SecurityCell::encode_new(0, 0, 2, &[0xAA; 8]).unwrap();
        payload.extend_from_slice(&[0u8; 12]);

        let sk = SecurityCell::parse(&payload, 0).unwrap();
        assert_eq!(sk.descriptor, vec![0xAA; 8]);
    }
}
