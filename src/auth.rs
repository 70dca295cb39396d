//! Shared-secret bearer token checks for the HTTP surface

use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// The scheme must be present; a bare token is not accepted.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Whether the request carries `expected` as its bearer token
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> bool {
    match bearer_token(headers) {
        Some(token) => constant_time_compare(token, expected),
        None => false,
    }
}

/// Compare secrets without short-circuiting on the first differing byte
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer secret")), Some("secret"));
        assert_eq!(bearer_token(&headers("secret")), None);
        assert_eq!(bearer_token(&headers("Basic c2VjcmV0")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_check_bearer() {
        assert!(check_bearer(&headers("Bearer secret"), "secret"));
        assert!(!check_bearer(&headers("Bearer secreT"), "secret"));
        assert!(!check_bearer(&headers("Bearer secret2"), "secret"));
        assert!(!check_bearer(&headers("secret"), "secret"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
        assert!(constant_time_compare("", ""));
    }
}
