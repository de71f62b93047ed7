//! Subdomain validation and extraction (spec §4.3, §4.4).

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-]{3,63}$").expect("valid regex"))
}

/// `^[a-z0-9-]{3,63}$`.
pub fn is_valid_label(label: &str) -> bool {
    pattern().is_match(label)
}

/// Extracts and validates the subdomain label from a `Host` header value.
///
/// Lowercases the host, strips a trailing `:port`, and requires it to end
/// with `.<base>` with a valid label in front. Returns `None` for a bad
/// host (no subdomain, or an invalid label) — callers turn that into a 404.
pub fn extract(host: &str, base: &str) -> Option<String> {
    let host = host.to_lowercase();
    let host = host.split(':').next().unwrap_or(&host);
    let suffix = format!(".{base}");

    if host == base || !host.ends_with(&suffix) {
        return None;
    }

    let label = &host[..host.len() - suffix.len()];
    if is_valid_label(label) {
        Some(label.to_string())
    } else {
        None
    }
}

const RANDOM_LABEL_LEN: usize = 7;
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A random 7-character base-36 label, used when a client doesn't request
/// a subdomain or its request is invalid/taken (spec §4.3 "Registration").
pub fn random_label() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_LABEL_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE36_ALPHABET.len());
            BASE36_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_labels() {
        assert!(is_valid_label("abc"));
        assert!(is_valid_label("my-app-123"));
        assert!(is_valid_label(&"a".repeat(63)));
    }

    #[test]
    fn rejects_invalid_labels() {
        assert!(!is_valid_label("ab")); // too short
        assert!(!is_valid_label(&"a".repeat(64))); // too long
        assert!(!is_valid_label("Has-Upper"));
        assert!(!is_valid_label("has_underscore"));
        assert!(!is_valid_label(""));
    }

    #[test]
    fn extract_finds_subdomain() {
        assert_eq!(
            extract("my-app.example.com", "example.com"),
            Some("my-app".to_string())
        );
        assert_eq!(
            extract("my-app.example.com:8443", "example.com"),
            Some("my-app".to_string())
        );
    }

    #[test]
    fn extract_rejects_bare_host() {
        assert_eq!(extract("example.com", "example.com"), None);
    }

    #[test]
    fn extract_rejects_non_matching_base() {
        assert_eq!(extract("my-app.other.com", "example.com"), None);
    }

    #[test]
    fn extract_rejects_invalid_label() {
        assert_eq!(extract("UP.example.com", "example.com"), None);
        assert_eq!(extract("ab.example.com", "example.com"), None);
    }

    #[test]
    fn random_label_is_well_formed() {
        let label = random_label();
        assert_eq!(label.len(), RANDOM_LABEL_LEN);
        assert!(is_valid_label(&label));
    }
}
