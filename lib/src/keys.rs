// Copyright 2024 The Stratum Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Base-36 keys used for node and copy ids.
//!
//! Keys are non-empty strings over the alphabet `0-9a-z`, ordered first by
//! length and then lexicographically, so `next_key` produces a monotonic
//! sequence: `"0"`, `"1"`, …, `"z"`, `"10"`, `"11"`, ….

const RADIX: u32 = 36;

fn digit_value(c: char) -> Option<u32> {
    c.to_digit(RADIX)
}

fn digit_char(value: u32) -> char {
    debug_assert!(value < RADIX);
    char::from_digit(value, RADIX).unwrap()
}

/// Whether `s` is a well-formed key.
pub fn is_key(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| digit_value(c).is_some())
}

/// Whether `s` is a well-formed node or copy key, permitting the `_` prefix
/// that marks ids temporary to a transaction.
pub fn is_node_key(s: &str) -> bool {
    match s.strip_prefix('_') {
        Some(rest) => is_key(rest),
        None => is_key(s),
    }
}

/// The successor of `key`.
pub fn next_key(key: &str) -> String {
    debug_assert!(is_key(key));
    let mut digits: Vec<u32> = key.chars().map(|c| digit_value(c).unwrap()).collect();
    let mut carry = true;
    for digit in digits.iter_mut().rev() {
        if !carry {
            break;
        }
        *digit += 1;
        carry = *digit == RADIX;
        if carry {
            *digit = 0;
        }
    }
    if carry {
        digits.insert(0, 1);
    }
    digits.into_iter().map(digit_char).collect()
}

/// The base-36 sum of two keys.
pub fn key_add(a: &str, b: &str) -> String {
    debug_assert!(is_key(a) && is_key(b));
    let a: Vec<u32> = a.chars().map(|c| digit_value(c).unwrap()).collect();
    let b: Vec<u32> = b.chars().map(|c| digit_value(c).unwrap()).collect();
    let mut result = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0;
    for i in 0..a.len().max(b.len()) {
        let da = a.len().checked_sub(i + 1).map_or(0, |j| a[j]);
        let db = b.len().checked_sub(i + 1).map_or(0, |j| b[j]);
        let sum = da + db + carry;
        result.push(sum % RADIX);
        carry = sum / RADIX;
    }
    if carry > 0 {
        result.push(carry);
    }
    result.into_iter().rev().map(digit_char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_key() {
        assert_eq!(next_key("0"), "1");
        assert_eq!(next_key("9"), "a");
        assert_eq!(next_key("z"), "10");
        assert_eq!(next_key("zz"), "100");
        assert_eq!(next_key("1z"), "20");
    }

    #[test]
    fn test_key_add() {
        assert_eq!(key_add("0", "0"), "0");
        assert_eq!(key_add("3", "4"), "7");
        assert_eq!(key_add("z", "1"), "10");
        assert_eq!(key_add("zz", "zz"), "1zy");
        assert_eq!(key_add("12", "0"), "12");
    }

    #[test]
    fn test_is_key() {
        assert!(is_key("0"));
        assert!(is_key("a9z"));
        assert!(!is_key(""));
        assert!(!is_key("A"));
        assert!(!is_key("1-2"));
        assert!(is_node_key("_3"));
        assert!(!is_node_key("_"));
    }

    #[test]
    fn next_key_is_monotonic() {
        let mut key = "y".to_string();
        for _ in 0..100 {
            let next = next_key(&key);
            assert!(key.len() < next.len() || (key.len() == next.len() && key < next));
            key = next;
        }
    }
}
