//! `key=value&key=value` environment strings
//!
//! The namespace encodes file metadata in this form both in RPC replies and
//! in bulk dumps, one record per line.

use std::collections::BTreeMap;

/// Parsed environment string
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Env {
    pairs: BTreeMap<String, String>,
}

impl Env {
    /// Parse an environment string, ignoring empty and key-less segments
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let pairs = input
            .trim()
            .split('&')
            .filter_map(|segment| segment.split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self { pairs }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    /// Numeric value parsed in the given radix, `0x` prefix tolerated
    #[must_use]
    pub fn get_num(&self, key: &str, radix: u32) -> Option<u64> {
        let raw = self.get(key)?.trim();
        let digits = if radix == 16 {
            raw.trim_start_matches("0x")
        } else {
            raw
        };
        u64::from_str_radix(digits, radix).ok()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let env = Env::parse("id=42&cid=7&checksum=abcd1234&location=3,!4&");
        assert_eq!(env.len(), 4);
        assert_eq!(env.get("checksum"), Some("abcd1234"));
        assert_eq!(env.get("location"), Some("3,!4"));
        assert_eq!(env.get_num("id", 10), Some(42));
        assert!(env.get("size").is_none());
    }

    #[test]
    fn test_hex_numbers() {
        let env = Env::parse("lid=0x20020002&bad=zz");
        assert_eq!(env.get_num("lid", 16), Some(0x2002_0002));
        assert_eq!(env.get_num("bad", 10), None);
    }

    #[test]
    fn test_empty_value_and_garbage() {
        let env = Env::parse("&&name=&noequals&=orphan");
        assert!(env.contains("name"));
        assert_eq!(env.get("name"), Some(""));
        assert_eq!(env.len(), 1);
    }
}
