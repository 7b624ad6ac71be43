//! Emulated-read substitution.
//!
//! When a trapped read is answered with emulated data, the hypervisor hands
//! the reader the bytes carried here instead of what lives in memory. The
//! buffer is a fixed-size owned value (8 bytes, one machine word), so the
//! response never aliases handler state and the access-monitor layer never
//! has anything to reclaim.

use super::insn::AccessSize;

/// Widest substitution an emulated read can carry: one 64-bit value.
pub const MAX_EMULATE_SIZE: usize = 8;

/// The data payload of an emulate-read event response.
///
/// Holds exactly `len` valid bytes in a fixed-size buffer, like the I/O
/// data of a port access: no heap allocation, no ownership questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedRead {
    /// The substitution bytes (only the first `len` are valid).
    data: [u8; MAX_EMULATE_SIZE],
    /// Number of valid bytes.
    len: u8,
}

impl EmulatedRead {
    /// The substituted bytes, exactly as the reader will observe them.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Number of substituted bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the response carries no bytes (never true for values built
    /// by [`substitute`]).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Package the low-order `width` bytes of `value` as an emulated-read
/// response.
///
/// The width can never exceed the buffer: [`AccessSize::bytes`] tops out at
/// [`MAX_EMULATE_SIZE`], so the resolver and this builder cannot disagree
/// on supported widths.
pub fn substitute(value: u64, width: AccessSize) -> EmulatedRead {
    let len = width.bytes();
    let mut data = [0u8; MAX_EMULATE_SIZE];
    data[..len].copy_from_slice(&value.to_le_bytes()[..len]);
    EmulatedRead {
        data,
        len: len as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitution_fidelity_for_every_width() {
        let value = 0x1122_3344_5566_7788u64;
        let cases = [
            (AccessSize::Byte, vec![0x88]),
            (AccessSize::Word, vec![0x88, 0x77]),
            (AccessSize::Dword, vec![0x88, 0x77, 0x66, 0x55]),
            (
                AccessSize::Qword,
                vec![0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            ),
        ];
        for (width, expected) in cases {
            let response = substitute(value, width);
            assert_eq!(response.bytes(), &expected[..]);
            assert_eq!(response.len(), width.bytes());
        }
    }

    #[test]
    fn test_high_bytes_never_leak_into_narrow_responses() {
        let response = substitute(0x0000_1234, AccessSize::Byte);
        assert_eq!(response.bytes(), &[0x34]);
        assert!(!response.is_empty());
    }

    #[test]
    fn test_narrow_value_widens_with_zeros() {
        let response = substitute(0x1234, AccessSize::Qword);
        assert_eq!(
            response.bytes(),
            &[0x34, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
