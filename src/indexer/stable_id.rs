use crate::model::Usr;
use blake3::Hasher;

/// Derive a symbol identifier from a textual USR or mangled signature.
///
/// The identifier is the first 64 bits (little endian) of the blake3 hash of the
/// text. It depends on nothing but the text, so the same external-linkage symbol
/// hashes identically in every translation unit, while front ends keep
/// internal-linkage symbols apart by folding the unit path into the USR text.
///
/// Zero is reserved for "no symbol" and is never returned.
pub fn usr_from_str(text: &str) -> Usr {
    let mut hasher = Hasher::new();
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    match u64::from_le_bytes(bytes) {
        0 => 1,
        value => value,
    }
}

/// Content hash of an event file, used to skip units whose input did not change.
pub fn content_hash(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_same_usr() {
        let a = usr_from_str("c:@N@ns@F@foo#I#");
        let b = usr_from_str("c:@N@ns@F@foo#I#");
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn overloads_get_distinct_usrs() {
        let int_overload = usr_from_str("c:@F@foo#I#");
        let bool_overload = usr_from_str("c:@F@foo#b#");
        assert_ne!(int_overload, bool_overload);
    }

    #[test]
    fn content_hash_is_short_hex() {
        let hash = content_hash(b"{\"event\":\"unit\"}");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(hash, content_hash(b"{}"));
    }
}
