//! Base-32 encoded 64-bit identifiers.
//!
//! A `Name` packs up to 12 characters from the alphabet `.12345a-z` (plus
//! a truncated 13th) into a `u64`. Lexicographic order of the encoded
//! string equals numeric order of the `u64`, so names can be used directly
//! as deterministic index keys. The zero value is the empty name and is
//! reserved (an empty payer is rejected by the table engine).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Alphabet for the 5-bit symbols; index == symbol value.
const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// 64-bit base-32 identifier used for accounts, scopes, tables and shards.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Name(pub u64);

impl Name {
    pub const fn new(value: u64) -> Self {
        Name(value)
    }

    /// The reserved empty name.
    pub const fn empty() -> Self {
        Name(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

fn symbol_of(c: u8) -> Option<u64> {
    match c {
        b'.' => Some(0),
        b'1'..=b'5' => Some((c - b'1' + 1) as u64),
        b'a'..=b'z' => Some((c - b'a' + 6) as u64),
        _ => None,
    }
}

/// Error produced when parsing a `Name` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameParseError {
    #[error("name is longer than 13 characters: {0:?}")]
    TooLong(String),
    #[error("invalid character {1:?} in name {0:?}")]
    InvalidChar(String, char),
    #[error("13th character of {0:?} must be one of '.1-5a-j'")]
    InvalidThirteenth(String),
}

impl FromStr for Name {
    type Err = NameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() > 13 {
            return Err(NameParseError::TooLong(s.to_string()));
        }
        let mut value: u64 = 0;
        for (i, &c) in bytes.iter().enumerate() {
            let sym =
                symbol_of(c).ok_or_else(|| NameParseError::InvalidChar(s.to_string(), c as char))?;
            if i < 12 {
                value |= sym << (64 - 5 * (i + 1));
            } else {
                // The 13th character only has 4 bits of room.
                if sym > 0x0f {
                    return Err(NameParseError::InvalidThirteenth(s.to_string()));
                }
                value |= sym;
            }
        }
        Ok(Name(value))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [b'.'; 13];
        let mut v = self.0;
        for i in (0..13).rev() {
            let sym = if i == 12 { v & 0x0f } else { v & 0x1f } as usize;
            out[i] = CHARMAP[sym];
            v >>= if i == 12 { 4 } else { 5 };
        }
        let trimmed = {
            let mut end = 13;
            while end > 0 && out[end - 1] == b'.' {
                end -= 1;
            }
            &out[..end]
        };
        // Safe: CHARMAP is ASCII.
        f.write_str(std::str::from_utf8(trimmed).unwrap_or(""))
    }
}

impl From<u64> for Name {
    fn from(value: u64) -> Self {
        Name(value)
    }
}

/// Shorthand used pervasively in tests and fixtures.
pub fn name(s: &str) -> Name {
    Name::from_str(s).unwrap_or_else(|e| panic!("bad name literal: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_simple() {
        for s in ["alice", "bob", "eosio.token", "a.b.c", "zzzzzzzzzzzz"] {
            let n: Name = s.parse().unwrap();
            assert_eq!(n.to_string(), s);
        }
    }

    #[test]
    fn test_empty_name_is_zero() {
        let n: Name = "".parse().unwrap();
        assert_eq!(n, Name::empty());
        assert!(n.is_empty());
        assert_eq!(n.to_string(), "");
    }

    #[test]
    fn test_ordering_matches_string_ordering() {
        let a = name("alice");
        let b = name("bob");
        assert!(a < b);
        let short = name("abc");
        let long = name("abcd");
        assert!(short < long);
    }

    #[test]
    fn test_thirteenth_char() {
        let n: Name = "aaaaaaaaaaaaj".parse().unwrap();
        assert_eq!(n.to_string(), "aaaaaaaaaaaaj");
        assert!("aaaaaaaaaaaaz".parse::<Name>().is_err());
    }

    #[test]
    fn test_invalid_chars_rejected() {
        assert!("Upper".parse::<Name>().is_err());
        assert!("with space".parse::<Name>().is_err());
        assert!("toolongname123".parse::<Name>().is_err());
        assert!("zero0".parse::<Name>().is_err());
    }

    #[test]
    fn test_trailing_dots_trimmed() {
        let n: Name = "abc..".parse().unwrap();
        assert_eq!(n.to_string(), "abc");
    }
}
