//! Domain name normalization and the reversed-label key scheme.
//!
//! Records are keyed by the A-label name with its labels reversed
//! (`www.example.com` → `com.example.www`). Lexical sort then groups zone
//! neighbors, and deriving the wildcard candidate for a lookup is a single
//! replacement of the final reversed label.

/// Prefix shared by every key this crate writes
pub const KEY_PREFIX: &str = "d";

/// Normalize a domain name: trim, strip the trailing dot, lowercase and
/// convert IDN labels to A-labels. A leading wildcard label is preserved.
/// Returns `None` for names that cannot be represented.
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    let (wildcard, rest) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if rest.is_empty() || rest.contains('*') {
        return None;
    }

    let ascii = idna::domain_to_ascii(rest).ok()?;
    if ascii.is_empty() {
        return None;
    }

    Some(if wildcard {
        format!("*.{}", ascii)
    } else {
        ascii
    })
}

/// Join a subdomain onto its zone apex; an empty subdomain names the apex.
pub fn join_name(subdomain: &str, zone: &str) -> String {
    let subdomain = subdomain.trim().trim_matches('.');
    if subdomain.is_empty() || subdomain == "@" {
        zone.to_string()
    } else {
        format!("{}.{}", subdomain, zone)
    }
}

/// Reverse the labels of a name (`www.example.com` ⇄ `com.example.www`).
/// The operation is its own inverse.
pub fn reverse_name(name: &str) -> String {
    let mut labels: Vec<&str> = name.split('.').collect();
    labels.reverse();
    labels.join(".")
}

/// Storage key of a record hash
pub fn record_key(reversed_name: &str, rtype: &str) -> String {
    format!("{}:{}:r:{}", KEY_PREFIX, reversed_name, rtype)
}

/// Storage key of a zone index set
pub fn zone_key(reversed_zone: &str) -> String {
    format!("{}:{}:z", KEY_PREFIX, reversed_zone)
}

/// Split a record key back into its reversed name and type
pub fn parse_record_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("d:")?;
    let (reversed_name, rtype) = rest.rsplit_once(":r:")?;
    if reversed_name.is_empty() || rtype.is_empty() {
        return None;
    }
    Some((reversed_name.to_string(), rtype.to_string()))
}

/// Wildcard candidate for a reversed name: the final reversed label (the
/// left-most label of the original name) replaced with `*`. `None` when the
/// name has a single label or already is a wildcard.
pub fn wildcard_candidate(reversed_name: &str) -> Option<String> {
    let (head, last) = reversed_name.rsplit_once('.')?;
    if last == "*" {
        return None;
    }
    Some(format!("{}.*", head))
}

/// Whether a name carries a wildcard label anywhere but the left-most
/// position (which is the only place one is permitted).
pub fn valid_wildcard_position(name: &str) -> bool {
    match name.find('*') {
        None => true,
        Some(0) => name == "*" || (name.starts_with("*.") && !name[1..].contains('*')),
        Some(_) => false,
    }
}

/// Subdomain of `reversed_name` relative to `reversed_zone`, restored to
/// original label order. `None` when the name is outside the zone.
pub fn subdomain_of(reversed_name: &str, reversed_zone: &str) -> Option<String> {
    if reversed_name == reversed_zone {
        return Some(String::new());
    }
    let rest = reversed_name
        .strip_prefix(reversed_zone)?
        .strip_prefix('.')?;
    Some(reverse_name(rest))
}

/// Iterate suffix candidates of a name, longest first, stopping at the
/// public-suffix registrable domain. This replaces the original's
/// "two right-most labels are atomic" heuristic with a real PSL lookup;
/// names without a known suffix fall back to a two-label floor.
pub fn zone_candidates(name: &str) -> Vec<String> {
    let bare = name.strip_prefix("*.").unwrap_or(name);
    let labels: Vec<&str> = bare.split('.').collect();

    let floor = addr::parse_domain_name(bare)
        .ok()
        .and_then(|parsed| parsed.root())
        .map(|root| root.split('.').count())
        .unwrap_or(2);

    let mut candidates = Vec::new();
    for start in 0..labels.len() {
        let remaining = labels.len() - start;
        if remaining < floor || remaining < 2 {
            break;
        }
        candidates.push(labels[start..].join("."));
    }
    candidates
}

/// Normalize and reverse in one step
pub fn reversed(input: &str) -> Option<String> {
    normalize_domain(input).map(|name| reverse_name(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_domain("WWW.Example.COM."),
            Some("www.example.com".to_string())
        );
        assert_eq!(
            normalize_domain("*.Test.example.com"),
            Some("*.test.example.com".to_string())
        );
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("."), None);
        // IDN goes to A-labels
        assert_eq!(
            normalize_domain("münchen.example"),
            Some("xn--mnchen-3ya.example".to_string())
        );
    }

    #[test]
    fn test_reverse_roundtrip() {
        assert_eq!(reverse_name("www.example.com"), "com.example.www");
        assert_eq!(reverse_name("com.example.www"), "www.example.com");
        assert_eq!(reverse_name("example"), "example");
    }

    #[test]
    fn test_record_key_roundtrip() {
        let key = record_key("com.example.www", "A");
        assert_eq!(key, "d:com.example.www:r:A");
        assert_eq!(
            parse_record_key(&key),
            Some(("com.example.www".to_string(), "A".to_string()))
        );
        assert_eq!(parse_record_key("d:broken"), None);
    }

    #[test]
    fn test_wildcard_candidate() {
        // sub.test.example.com reversed, wildcard at the original left-most label
        assert_eq!(
            wildcard_candidate("com.example.test.sub"),
            Some("com.example.test.*".to_string())
        );
        assert_eq!(wildcard_candidate("com.example.test.*"), None);
        assert_eq!(wildcard_candidate("com"), None);
    }

    #[test]
    fn test_wildcard_position() {
        assert!(valid_wildcard_position("www.example.com"));
        assert!(valid_wildcard_position("*.example.com"));
        assert!(!valid_wildcard_position("www.*.example.com"));
        assert!(!valid_wildcard_position("w*w.example.com"));
    }

    #[test]
    fn test_subdomain_of() {
        assert_eq!(
            subdomain_of("com.example.www", "com.example"),
            Some("www".to_string())
        );
        assert_eq!(
            subdomain_of("com.example.test.*", "com.example"),
            Some("*.test".to_string())
        );
        assert_eq!(subdomain_of("com.example", "com.example"), Some(String::new()));
        assert_eq!(subdomain_of("org.other", "com.example"), None);
    }

    #[test]
    fn test_zone_candidates_respect_psl() {
        let candidates = zone_candidates("a.b.example.co.uk");
        assert_eq!(
            candidates,
            vec![
                "a.b.example.co.uk".to_string(),
                "b.example.co.uk".to_string(),
                "example.co.uk".to_string(),
            ]
        );
        // never walks into the public suffix itself
        assert!(!candidates.contains(&"co.uk".to_string()));
    }

    #[test]
    fn test_zone_candidates_wildcard() {
        let candidates = zone_candidates("*.test.example.com");
        assert_eq!(candidates[0], "test.example.com");
        assert_eq!(candidates.last().unwrap(), "example.com");
    }
}
