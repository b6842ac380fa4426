//! Server-name glob patterns.
//!
//! `*` matches any run of characters (including none) and `?` matches exactly
//! one character. Everything else is literal.

use regex::Regex;

/// Compile a glob into an anchored regular expression.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_subdomains() {
        let re = compile_glob("*.evil.example").unwrap();
        assert!(re.is_match("a.evil.example"));
        assert!(re.is_match(".evil.example"));
        assert!(!re.is_match("evil.example"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let re = compile_glob("s?.example").unwrap();
        assert!(re.is_match("s1.example"));
        assert!(!re.is_match("s12.example"));
    }

    #[test]
    fn dots_are_literal() {
        let re = compile_glob("a.example").unwrap();
        assert!(!re.is_match("aXexample"));
    }
}
