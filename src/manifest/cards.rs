//! Shared card tokenizer used by every manifest kind (§4.2.1): split the canonical textual
//! form into `Card { code, fields }` lines before any kind-specific decoding happens, the
//! way `ObjectTrait::from_bytes`/`from_buf_read` separates "get raw bytes" from "interpret
//! bytes as a specific object." Field bytes are not assumed UTF-8 — a path may contain
//! arbitrary bytes — so fields are kept as `BString`, unescaped per the F-format.

use bstr::{BString, ByteSlice};

use crate::errors::FossilError;

/// One decoded card line: an uppercase ASCII letter code plus its space-separated,
/// F-unescaped fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub code: u8,
    pub fields: Vec<BString>,
}

/// F-format escape: space, control characters, and backslash get a two-character escape.
pub fn escape_field(raw: &[u8]) -> BString {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            b' ' => out.extend_from_slice(b"\\s"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x0c => out.extend_from_slice(b"\\f"),
            0x0b => out.extend_from_slice(b"\\v"),
            0x00 => out.extend_from_slice(b"\\0"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            other => out.push(other),
        }
    }
    BString::from(out)
}

/// Inverse of [`escape_field`]. Unknown escape sequences pass the backslash and following
/// byte through unchanged rather than erroring, matching the tolerant-reader stance §4.2.1
/// takes toward out-of-scope artifact kinds.
pub fn unescape_field(raw: &[u8]) -> BString {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b's') => out.push(b' '),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'f') => out.push(0x0c),
            Some(b'v') => out.push(0x0b),
            Some(b'0') => out.push(0x00),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    BString::from(out)
}

/// Split a manifest's bytes into cards. Each non-empty line becomes one `Card`; the line's
/// first byte is the code, the rest are space-separated fields, each F-unescaped.
pub fn tokenize(data: &[u8]) -> Result<Vec<Card>, FossilError> {
    let mut cards = Vec::new();
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let code = line[0];
        if !code.is_ascii_uppercase() {
            return Err(FossilError::Integrity(format!(
                "card line does not start with an uppercase code: {:?}",
                line.as_bstr()
            )));
        }
        let rest = &line[1..];
        let mut fields = Vec::new();
        if !rest.is_empty() {
            // fields are separated by single spaces; the leading byte after the code is
            // always a space if fields follow.
            let body = if rest.first() == Some(&b' ') {
                &rest[1..]
            } else {
                return Err(FossilError::Integrity(format!(
                    "card {} has no separating space before its fields",
                    code as char
                )));
            };
            for field in body.split(|&b| b == b' ') {
                fields.push(unescape_field(field));
            }
        }
        cards.push(Card { code, fields });
    }
    Ok(cards)
}

/// Render cards back to canonical bytes. Caller is responsible for card ordering.
pub fn render(cards: &[Card]) -> Vec<u8> {
    let mut out = Vec::new();
    for card in cards {
        out.push(card.code);
        for field in &card.fields {
            out.push(b' ');
            out.extend_from_slice(&escape_field(field));
        }
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn escape_then_unescape_known_bytes() {
        let raw = b"a b\tc\nd\re\x0cf\x0bg\x00h\\i";
        let escaped = escape_field(raw);
        let unescaped = unescape_field(&escaped);
        assert_eq!(unescaped.as_slice(), raw);
    }

    #[test]
    fn tokenize_simple_commit_skeleton() {
        let data = b"C fix\\sbug\nD 2024-01-01T00:00:00.000\nU alice\nZ deadbeef\n";
        let cards = tokenize(data).unwrap();
        assert_eq!(cards.len(), 4);
        assert_eq!(cards[0].code, b'C');
        assert_eq!(cards[0].fields[0].as_slice(), b"fix bug");
        assert_eq!(cards[3].code, b'Z');
    }

    #[quickcheck]
    fn escape_law_round_trips_any_byte_string_without_newline(bytes: Vec<u8>) -> bool {
        let filtered: Vec<u8> = bytes.into_iter().filter(|&b| b != b'\n').collect();
        let escaped = escape_field(&filtered);
        unescape_field(&escaped).as_slice() == filtered.as_slice()
    }
}
