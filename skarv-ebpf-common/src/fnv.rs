//! FNV-1a 64-bit hostname hashing.
//!
//! The ingress program hashes the SNI hostname inline (same constants, same
//! case folding) and looks the result up in the SNI route map, so userspace
//! must produce identical hashes when it populates that map.

/// FNV-1a 64-bit offset basis.
pub const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hostnames longer than this are truncated before hashing. The in-kernel
/// parser reads at most this many bytes of the server_name extension.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// FNV-1a 64 over the hostname with ASCII `A..Z` folded to lowercase by
/// adding 32, truncated to the first [`MAX_HOSTNAME_LEN`] bytes.
pub fn hostname_hash(name: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in name.iter().take(MAX_HOSTNAME_LEN) {
        let b = if b.is_ascii_uppercase() { b + 32 } else { b };
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_offset_basis() {
        assert_eq!(hostname_hash(b""), FNV_OFFSET_BASIS);
    }

    #[test]
    fn known_vector() {
        // FNV-1a 64 of "a" per the reference parameters.
        assert_eq!(hostname_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn case_is_folded() {
        assert_eq!(hostname_hash(b"API.Example.COM"), hostname_hash(b"api.example.com"));
        assert_ne!(hostname_hash(b"api.example.com"), hostname_hash(b"api.example.org"));
    }

    #[test]
    fn truncated_at_64_bytes() {
        let long: Vec<u8> = (0..200).map(|i| b'a' + (i % 26) as u8).collect();
        assert_eq!(hostname_hash(&long), hostname_hash(&long[..MAX_HOSTNAME_LEN]));
        assert_ne!(hostname_hash(&long[..MAX_HOSTNAME_LEN - 1]), hostname_hash(&long));
    }
}
