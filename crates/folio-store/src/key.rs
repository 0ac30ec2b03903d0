//! Cache keys and their filesystem-safe encoding

/// Separator between collection id and sequence in a cache key.
pub const KEY_SEPARATOR: char = ':';

/// Deterministic key for `(collection_id, sequence)`.
pub fn cache_key(collection_id: &str, sequence: u32) -> String {
    format!("{collection_id}{KEY_SEPARATOR}{sequence}")
}

/// Prefix shared by every key of a collection.
///
/// Includes the separator so that `"12"` does not match keys of `"123"`.
pub fn collection_prefix(collection_id: &str) -> String {
    format!("{collection_id}{KEY_SEPARATOR}")
}

/// Split a key back into `(collection_id, sequence)`.
///
/// Splits on the last separator, so collection ids may contain `:`.
pub fn parse_cache_key(key: &str) -> Option<(&str, u32)> {
    let (collection_id, sequence) = key.rsplit_once(KEY_SEPARATOR)?;
    Some((collection_id, sequence.parse().ok()?))
}

/// Encode a key as a file stem: `[A-Za-z0-9_-]` kept, everything else `%XX`.
///
/// Encoding is per byte, so the encoding of a prefix is a prefix of the
/// encoding of every key that starts with it.
pub fn encode_file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_file_stem`]. `None` for stems it could not produce.
pub fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
