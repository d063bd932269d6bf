//! Limiter key derivation from caller addresses.

/// Key used when no caller address is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Derive the limiter identifier for a caller.
///
/// Prefers the first address in a forwarded-address chain such as an
/// `X-Forwarded-For` header value, then a single proxy-supplied address such
/// as `X-Real-IP`, then the direct connection address, and falls back to
/// [`UNKNOWN_CLIENT`]. The result is never empty.
pub fn extract_key(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: Option<&str>,
) -> String {
    forwarded_for
        .and_then(|chain| chain.split(',').next())
        .and_then(non_empty)
        .or_else(|| real_ip.and_then(non_empty))
        .or_else(|| remote_addr.and_then(non_empty))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

fn non_empty(addr: &str) -> Option<&str> {
    Some(addr.trim()).filter(|addr| !addr.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_forwarded_address_wins() {
        let key = extract_key(
            Some("203.0.113.7, 10.0.0.2, 10.0.0.1"),
            Some("10.0.0.2"),
            Some("10.0.0.1"),
        );
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn test_single_forwarded_address() {
        assert_eq!(extract_key(Some(" 2001:db8::1 "), None, None), "2001:db8::1");
    }

    #[test]
    fn test_real_ip_before_remote_address() {
        assert_eq!(
            extract_key(None, Some(" 198.51.100.4 "), Some("10.0.0.1")),
            "198.51.100.4"
        );
        assert_eq!(
            extract_key(Some(" , 10.0.0.2"), Some("198.51.100.4"), Some("10.0.0.1")),
            "198.51.100.4"
        );
        assert_eq!(extract_key(None, Some(""), Some("10.0.0.1")), "10.0.0.1");
    }

    #[test]
    fn test_falls_back_to_remote_address() {
        assert_eq!(extract_key(None, None, Some("192.0.2.10")), "192.0.2.10");
        assert_eq!(extract_key(Some(""), None, Some("192.0.2.10")), "192.0.2.10");
        assert_eq!(
            extract_key(Some(" , 10.0.0.1"), None, Some("192.0.2.10")),
            "192.0.2.10"
        );
    }

    #[test]
    fn test_unknown_sentinel() {
        assert_eq!(extract_key(None, None, None), UNKNOWN_CLIENT);
        assert_eq!(extract_key(Some("  "), Some(" "), Some("")), UNKNOWN_CLIENT);
    }
}
