use std::fmt;
use std::str::FromStr;

use memchr::memmem;

use crate::error::{Error, Result};

/// Parse IDA-style pattern text. `?` and `??` are wildcards.
pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidPattern(format!("Invalid signature token '{}': {}", token, e))
        })?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidPattern("Signature pattern is empty".to_string()));
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compiled byte signature: needle, wildcard mask and Horspool shift table.
#[derive(Clone)]
pub struct Signature {
    needle: Vec<u8>,
    /// `true` where the byte must match
    mask: Vec<bool>,
    shift: [usize; 256],
    wildcards: bool,
}

impl Signature {
    pub fn new(pattern: &[Option<u8>]) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern("Signature pattern is empty".to_string()));
        }

        let needle: Vec<u8> = pattern.iter().map(|b| b.unwrap_or(0)).collect();
        let mask: Vec<bool> = pattern.iter().map(Option::is_some).collect();
        let wildcards = mask.iter().any(|&m| !m);
        let shift = build_shift_table(pattern);

        Ok(Self {
            needle,
            mask,
            shift,
            wildcards,
        })
    }

    pub fn len(&self) -> usize {
        self.needle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needle.is_empty()
    }

    pub fn has_wildcards(&self) -> bool {
        self.wildcards
    }

    pub fn pattern(&self) -> Vec<Option<u8>> {
        self.needle
            .iter()
            .zip(&self.mask)
            .map(|(&b, &m)| m.then_some(b))
            .collect()
    }

    /// Skip distance when `byte` sits under the last needle position.
    pub fn shift_for(&self, byte: u8) -> usize {
        self.shift[byte as usize]
    }

    pub fn matches_at(&self, haystack: &[u8], position: usize) -> bool {
        let Some(window) = haystack.get(position..position + self.len()) else {
            return false;
        };
        window
            .iter()
            .zip(&self.needle)
            .zip(&self.mask)
            .rev()
            .all(|((&h, &n), &m)| !m || h == n)
    }

    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        self.find_from(haystack, 0)
    }

    /// First match at or after `start`.
    pub fn find_from(&self, haystack: &[u8], start: usize) -> Option<usize> {
        let m = self.len();
        if start > haystack.len() || haystack.len() - start < m {
            return None;
        }

        if !self.wildcards {
            return memmem::find(&haystack[start..], &self.needle).map(|i| i + start);
        }

        let last = m - 1;
        let mut position = start;
        while position + m <= haystack.len() {
            if self.matches_at(haystack, position) {
                return Some(position);
            }
            position += self.shift[haystack[position + last] as usize];
        }
        None
    }

    /// Every match, overlapping ones included.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        let mut results = Vec::new();
        let mut start = 0;
        while let Some(position) = self.find_from(haystack, start) {
            results.push(position);
            start = position + 1;
        }
        results
    }
}

/// Bad-character table. A wildcard before the last position caps every
/// shift at its distance from the end, so no true match is skipped.
fn build_shift_table(pattern: &[Option<u8>]) -> [usize; 256] {
    let m = pattern.len();
    let last = m - 1;

    let last_wildcard = pattern[..last].iter().rposition(Option::is_none);
    let default = last_wildcard.map_or(m, |w| last - w);
    let mut table = [default; 256];

    let first = last_wildcard.map_or(0, |w| w + 1);
    for (j, byte) in pattern.iter().enumerate().take(last).skip(first) {
        if let Some(b) = byte {
            table[*b as usize] = last - j;
        }
    }
    table
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(&parse_pattern(s)?)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_pattern(&self.pattern()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn naive_find_all(haystack: &[u8], pattern: &[Option<u8>]) -> Vec<usize> {
        if haystack.len() < pattern.len() {
            return Vec::new();
        }
        (0..=haystack.len() - pattern.len())
            .filter(|&i| {
                pattern
                    .iter()
                    .enumerate()
                    .all(|(j, b)| b.is_none_or(|v| haystack[i + j] == v))
            })
            .collect()
    }

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let bytes = parse_pattern("48 8D 0D ? ?? ?? ??").unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], Some(0x48));
        assert_eq!(bytes[2], Some(0x0D));
        assert_eq!(bytes[3], None);
        assert_eq!(bytes[4], None);
    }

    #[test]
    fn test_parse_pattern_rejects_garbage() {
        assert!(matches!(parse_pattern(""), Err(Error::InvalidPattern(_))));
        assert!(matches!(parse_pattern("48 ZZ"), Err(Error::InvalidPattern(_))));
        assert!(matches!(parse_pattern("480"), Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn test_format_pattern_roundtrip() {
        let pattern = vec![Some(0x48), Some(0x8D), None, Some(0xFF)];
        let formatted = format_pattern(&pattern);
        assert_eq!(formatted, "48 8D ?? FF");
        assert_eq!(parse_pattern(&formatted).unwrap(), pattern);

        let signature: Signature = "e8 ? 0a".parse().unwrap();
        assert_eq!(signature.to_string(), "E8 ?? 0A");
    }

    #[test]
    fn test_single_occurrence_found() {
        let mut haystack = vec![0u8; 300];
        haystack[200..204].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let signature: Signature = "DE AD BE EF".parse().unwrap();

        assert!(!signature.has_wildcards());
        assert_eq!(signature.find(&haystack), Some(200));
        assert_eq!(signature.find_all(&haystack), vec![200]);
    }

    #[test]
    fn test_no_occurrence() {
        let haystack = vec![0x90u8; 64];
        let signature: Signature = "CC ?? CC".parse().unwrap();
        assert_eq!(signature.find(&haystack), None);
        assert!(signature.find_all(&haystack).is_empty());
    }

    #[test]
    fn test_wildcards_never_gate_equality() {
        let signature: Signature = "48 ?? ?? 90".parse().unwrap();
        for a in [0x00u8, 0x7F, 0xFF] {
            for b in [0x01u8, 0x90, 0xFE] {
                let haystack = [0x11, 0x48, a, b, 0x90, 0x22];
                assert_eq!(signature.find(&haystack), Some(1));
            }
        }
    }

    #[test]
    fn test_shift_table_respects_wildcards() {
        let signature: Signature = "AA ?? BB CC".parse().unwrap();
        // last wildcard is 2 away from the end
        assert_eq!(signature.shift_for(0x00), 2);
        assert_eq!(signature.shift_for(0xBB), 1);
        // bytes before the wildcard cannot lengthen the skip
        assert_eq!(signature.shift_for(0xAA), 2);

        let plain: Signature = "AA BB CC".parse().unwrap();
        assert_eq!(plain.shift_for(0x00), 3);
        assert_eq!(plain.shift_for(0xAA), 2);
        assert_eq!(plain.shift_for(0xCC), 3);

        // trailing wildcard does not clamp
        let trailing: Signature = "AA ??".parse().unwrap();
        assert_eq!(trailing.shift_for(0x42), 2);
        assert_eq!(trailing.shift_for(0xAA), 1);
    }

    #[test]
    fn test_overlapping_matches() {
        let signature: Signature = "AA ?? AA".parse().unwrap();
        let haystack = [0xAA, 0x00, 0xAA, 0x00, 0xAA];
        assert_eq!(signature.find_all(&haystack), vec![0, 2]);
    }

    #[test]
    fn test_horspool_matches_naive_randomized() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let len = rng.gen_range(0..256);
            // small alphabet so matches actually happen
            let haystack: Vec<u8> = (0..len).map(|_| rng.gen_range(0..4u8)).collect();
            let pattern_len = rng.gen_range(1..6);
            let pattern: Vec<Option<u8>> = (0..pattern_len)
                .map(|_| {
                    if rng.gen_bool(0.3) {
                        None
                    } else {
                        Some(rng.gen_range(0..4u8))
                    }
                })
                .collect();

            let signature = Signature::new(&pattern).unwrap();
            assert_eq!(
                signature.find_all(&haystack),
                naive_find_all(&haystack, &pattern),
                "pattern {} over {:?}",
                format_pattern(&pattern),
                haystack
            );
        }
    }

    #[test]
    fn test_find_from_past_end() {
        let signature: Signature = "01".parse().unwrap();
        assert_eq!(signature.find_from(&[1, 1], 5), None);
        assert_eq!(signature.find_from(&[1, 1], 2), None);
        assert_eq!(signature.find_from(&[1, 1], 1), Some(1));
    }
}
