//! Backend identifier sanitization
//!
//! Storage backends derive resource names (SQL table names, Redis key
//! segments) from user-supplied inbox names. Raw names are normalized
//! to the portable identifier alphabet `[a-z0-9_]` before use.

/// Maximum identifier length accepted by PostgreSQL
pub const POSTGRES_IDENTIFIER_LIMIT: usize = 63;

/// Sanitize a raw name into a backend-safe identifier.
///
/// Lowercases the input, replaces every character outside `[a-z0-9_]`
/// with `_`, prepends `_` when the first character is a digit, and
/// truncates to `max_len`. The function is idempotent:
/// `sanitize_identifier(sanitize_identifier(x, n), n)` equals
/// `sanitize_identifier(x, n)`.
pub fn sanitize_identifier(raw: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(raw.len() + 1);

    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }

    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    out.truncate(max_len);
    out
}
