//! Firmware image scrambling.
//!
//! The bootloaders in this controller family refuse raw firmware images:
//! flash contents must be stored in a scrambled representation, and reads
//! come back scrambled the same way. The transform is pure obfuscation —
//! it carries no error-detection value — and consists of a fixed 52-byte
//! XOR keystream combined with a bit-order reversal of every byte. Both
//! halves are family constants burned into the controller ROM; images
//! written with a different key or permutation are rejected at boot.
//!
//! [`decode_firmware`] and [`encode_firmware`] are exact inverses:
//! `decode(encode(x)) == x` for every byte blob.

/// XOR keystream, thirteen 32-bit words applied byte-wise in little-endian
/// order and repeated every 52 bytes.
const XOR_KEY: [u32; 13] = [
    0xE7C29474, 0x79084B10, 0x53D54B0D, 0xFC1E8F32, 0x48E81A9B, 0x773C808E, 0xB7483552,
    0xD9CB8C76, 0x2A8C8BC6, 0x0967ADA8, 0xD4520F5C, 0xD0C3279D, 0xEAC091C5,
];

/// Length of the repeating keystream in bytes.
const KEY_LEN: usize = XOR_KEY.len() * 4;

fn key_byte(index: usize) -> u8 {
    let offset = index % KEY_LEN;
    XOR_KEY[offset / 4].to_le_bytes()[offset % 4]
}

/// Decode a firmware image read back from flash, in place.
///
/// XOR with the keystream first, then reverse the bit order of each byte.
pub fn decode_firmware(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (*byte ^ key_byte(i)).reverse_bits();
    }
}

/// Encode a raw firmware image for writing to flash, in place.
///
/// Reverse the bit order of each byte, then XOR with the keystream.
pub fn encode_firmware(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = byte.reverse_bits() ^ key_byte(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original: Vec<u8> = (0..=255).cycle().take(1024).collect();
        let mut data = original.clone();
        encode_firmware(&mut data);
        assert_ne!(data, original);
        decode_firmware(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_round_trip_unaligned_length() {
        // Lengths that are not multiples of the key period or word size
        for len in [1, 3, 51, 53, 107] {
            let original: Vec<u8> = (0..len as u8).collect();
            let mut data = original.clone();
            encode_firmware(&mut data);
            decode_firmware(&mut data);
            assert_eq!(data, original, "length {len}");
        }
    }

    #[test]
    fn test_round_trip_empty() {
        let mut data: Vec<u8> = Vec::new();
        encode_firmware(&mut data);
        decode_firmware(&mut data);
        assert!(data.is_empty());
    }

    #[test]
    fn test_keystream_period() {
        assert_eq!(KEY_LEN, 52);
        assert_eq!(key_byte(0), key_byte(KEY_LEN));
        assert_eq!(key_byte(7), key_byte(7 + 2 * KEY_LEN));
    }

    #[test]
    fn test_encode_first_byte() {
        // First key byte is the low byte of the first key word
        let mut data = vec![0x00];
        encode_firmware(&mut data);
        assert_eq!(data[0], 0x74);
    }

    #[test]
    fn test_encode_is_not_identity() {
        let mut data = vec![0u8; 64];
        encode_firmware(&mut data);
        assert!(data.iter().any(|&b| b != 0));
    }
}
