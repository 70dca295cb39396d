//! Allow-list validation for every tenant-controlled string that reaches
//! generated proxy configuration.
//!
//! Validators never panic: they classify input as accepted (returning a
//! normalized newtype) or rejected (returning a [`ValidationError`]). The
//! newtypes can only be constructed through their validator, so holding a
//! `Slug` or `Hostname` is proof that the value passed the grammar.

use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Maximum length of a full hostname
const MAX_HOSTNAME_LEN: usize = 253;
/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;
/// Maximum length of a custom header name
const MAX_HEADER_NAME_LEN: usize = 128;
/// Maximum length of a custom header value
const MAX_HEADER_VALUE_LEN: usize = 4096;
/// Maximum length of ids and pool names
const MAX_IDENTIFIER_LEN: usize = 63;
/// Suffix of every file managed by the pipeline
pub const MANAGED_SUFFIX: &str = ".conf";

/// Why a value was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid slug {value:?}: {reason}")]
    Slug { value: String, reason: &'static str },

    #[error("invalid hostname {value:?}: {reason}")]
    Hostname { value: String, reason: &'static str },

    #[error("invalid IPv4 address or CIDR {value:?}")]
    IpOrCidr { value: String },

    #[error("invalid header name {value:?}")]
    HeaderName { value: String },

    #[error("header value {value:?} contains a line break")]
    HeaderInjection { value: String },

    #[error("invalid header value {value:?}: {reason}")]
    HeaderValue { value: String, reason: &'static str },

    #[error("invalid identifier {value:?}: {reason}")]
    Identifier { value: String, reason: &'static str },

    #[error("invalid upstream target {value:?}: {reason}")]
    Target { value: String, reason: &'static str },
}

macro_rules! validated_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_string!(
    /// Tenant slug: `^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$`
    Slug
);
validated_string!(
    /// Lowercased hostname made of letters, digits, dots and hyphens
    Hostname
);
validated_string!(
    /// IPv4 address, optionally with a `/0`..`/32` prefix
    IpRule
);
validated_string!(
    /// Response header name: `^[A-Za-z0-9-]+$`
    HeaderName
);
validated_string!(
    /// Response header value free of control characters
    HeaderValue
);
validated_string!(
    /// Opaque id or pool name: `^[A-Za-z0-9_-]{1,63}$`
    Identifier
);

/// Validate a tenant slug.
///
/// The same grammar applies when a tenant is created and when it is rendered.
pub fn validate_slug(s: &str) -> Result<Slug, ValidationError> {
    let reject = |reason| ValidationError::Slug {
        value: s.to_string(),
        reason,
    };

    if s.len() < 3 || s.len() > 63 {
        return Err(reject("must be 3-63 characters"));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(reject("only lowercase letters, digits and hyphens are allowed"));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(reject("must not start or end with a hyphen"));
    }

    Ok(Slug(s.to_string()))
}

/// Validate a hostname and normalize it to lowercase.
pub fn validate_hostname(s: &str) -> Result<Hostname, ValidationError> {
    let reject = |reason| ValidationError::Hostname {
        value: s.to_string(),
        reason,
    };

    if s.is_empty() {
        return Err(reject("must not be empty"));
    }
    if s.len() > MAX_HOSTNAME_LEN {
        return Err(reject("longer than 253 characters"));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return Err(reject("only letters, digits, dots and hyphens are allowed"));
    }
    if s.starts_with('.') || s.ends_with('.') {
        return Err(reject("must not start or end with a dot"));
    }
    if s.contains("..") {
        return Err(reject("must not contain consecutive dots"));
    }
    for label in s.split('.') {
        if label.len() > MAX_LABEL_LEN {
            return Err(reject("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(reject("label must not start or end with a hyphen"));
        }
    }

    Ok(Hostname(s.to_ascii_lowercase()))
}

/// Validate a dotted-quad IPv4 address with an optional `/0`..`/32` prefix.
///
/// IPv6 is rejected.
pub fn validate_ip_or_cidr(s: &str) -> Result<IpRule, ValidationError> {
    let reject = || ValidationError::IpOrCidr {
        value: s.to_string(),
    };

    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    };

    // Ipv4Addr rejects leading zeros, so "010.0.0.1" cannot be read as octal
    let addr: Ipv4Addr = addr.parse().map_err(|_| reject())?;

    match prefix {
        None => Ok(IpRule(addr.to_string())),
        Some(prefix) => {
            let well_formed = !prefix.is_empty()
                && prefix.len() <= 2
                && prefix.bytes().all(|b| b.is_ascii_digit())
                && !(prefix.len() > 1 && prefix.starts_with('0'));
            if !well_formed {
                return Err(reject());
            }
            let bits: u8 = prefix.parse().map_err(|_| reject())?;
            if bits > 32 {
                return Err(reject());
            }
            Ok(IpRule(format!("{}/{}", addr, bits)))
        }
    }
}

/// Validate a bare IPv4 address (no prefix), as reported by proxy nodes.
pub fn validate_ipv4(s: &str) -> Result<Ipv4Addr, ValidationError> {
    s.parse().map_err(|_| ValidationError::IpOrCidr {
        value: s.to_string(),
    })
}

/// Validate a custom response header name.
pub fn validate_header_name(s: &str) -> Result<HeaderName, ValidationError> {
    let valid = !s.is_empty()
        && s.len() <= MAX_HEADER_NAME_LEN
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');

    if valid {
        Ok(HeaderName(s.to_string()))
    } else {
        Err(ValidationError::HeaderName {
            value: s.to_string(),
        })
    }
}

/// Validate a header value exactly as supplied.
///
/// Any line break is treated as a response-splitting attempt and rejected;
/// this is the form the compiler uses. `$` is rejected too: nginx expands
/// variables inside `add_header` values, so `$cookie_session` would echo
/// request data back to the client.
pub fn validate_header_value(s: &str) -> Result<HeaderValue, ValidationError> {
    if s.contains(['\r', '\n']) {
        return Err(ValidationError::HeaderInjection {
            value: s.to_string(),
        });
    }
    if s.chars().any(char::is_control) {
        return Err(ValidationError::HeaderValue {
            value: s.to_string(),
            reason: "contains control characters",
        });
    }
    if s.contains('$') {
        return Err(ValidationError::HeaderValue {
            value: s.to_string(),
            reason: "contains '$', which nginx would expand as a variable",
        });
    }
    if s.len() > MAX_HEADER_VALUE_LEN {
        return Err(ValidationError::HeaderValue {
            value: s.to_string(),
            reason: "longer than 4096 bytes",
        });
    }

    Ok(HeaderValue(s.to_string()))
}

/// Strip CR/LF from operator input, then apply [`validate_header_value`].
///
/// Used when policies are imported so stored values are already clean.
pub fn sanitize_header_value(s: &str) -> Result<HeaderValue, ValidationError> {
    let stripped: String = s.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    validate_header_value(&stripped)
}

/// Validate an opaque id or upstream pool name.
pub fn validate_identifier(s: &str) -> Result<Identifier, ValidationError> {
    let reject = |reason| ValidationError::Identifier {
        value: s.to_string(),
        reason,
    };

    if s.is_empty() || s.len() > MAX_IDENTIFIER_LEN {
        return Err(reject("must be 1-63 characters"));
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(reject("only letters, digits, hyphens and underscores are allowed"));
    }

    Ok(Identifier(s.to_string()))
}

/// Filename of the artifact for a `(slug, domain)` pair.
pub fn managed_filename(slug: &Slug, domain: &Hostname) -> String {
    format!("{}_{}{}", slug, domain, MANAGED_SUFFIX)
}

/// Recognize a filename produced by [`managed_filename`].
///
/// Slugs never contain underscores, so the first underscore is the
/// separator. Returns `None` for foreign files, which the deployer must
/// never touch.
pub fn parse_managed_filename(name: &str) -> Option<(Slug, Hostname)> {
    let stem = name.strip_suffix(MANAGED_SUFFIX)?;
    let (slug, host) = stem.split_once('_')?;
    let slug = validate_slug(slug).ok()?;
    let host = validate_hostname(host).ok()?;

    // Only the canonical lowercase spelling is ours
    if host.as_str() != &stem[slug.as_str().len() + 1..] {
        return None;
    }

    Some((slug, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_accepts_grammar() {
        assert_eq!(validate_slug("acme").unwrap().as_str(), "acme");
        assert!(validate_slug("valid-slug-1").is_ok());
        assert!(validate_slug("a1b").is_ok());
        assert!(validate_slug(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_slug_rejections() {
        assert!(validate_slug("Invalid_Slug!").is_err());
        assert!(validate_slug("ab").is_err());
        assert!(validate_slug(&"a".repeat(64)).is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme-").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("ac me").is_err());
        assert!(validate_slug("acme;").is_err());
        assert!(validate_slug("acme_corp").is_err());
    }

    #[test]
    fn test_hostname_normalizes_case() {
        assert_eq!(
            validate_hostname("Acme.Example.COM").unwrap().as_str(),
            "acme.example.com"
        );
        assert!(validate_hostname("10.0.0.5").is_ok());
        assert!(validate_hostname("localhost").is_ok());
    }

    #[test]
    fn test_hostname_rejects_directive_characters() {
        for bad in [
            "",
            "example.com;",
            "exa mple.com",
            "example.com/path",
            "example.com\n",
            ".example.com",
            "example.com.",
            "example..com",
            "-example.com",
            "example-.com",
            "*.example.com",
            "exam_ple.com",
            "example.com}",
        ] {
            assert!(validate_hostname(bad).is_err(), "{bad:?} should be rejected");
        }

        let long_label = format!("{}.com", "a".repeat(64));
        assert!(validate_hostname(&long_label).is_err());
    }

    #[test]
    fn test_ip_or_cidr() {
        assert_eq!(validate_ip_or_cidr("10.0.0.1").unwrap().as_str(), "10.0.0.1");
        assert_eq!(
            validate_ip_or_cidr("192.168.0.0/16").unwrap().as_str(),
            "192.168.0.0/16"
        );
        assert!(validate_ip_or_cidr("0.0.0.0/0").is_ok());
        assert!(validate_ip_or_cidr("10.0.0.1/32").is_ok());

        for bad in [
            "10.0.0.1/33",
            "10.0.0.1/",
            "10.0.0.1/08",
            "10.0.0",
            "256.0.0.1",
            "010.0.0.1",
            "::1",
            "fe80::/10",
            "10.0.0.1; allow all",
            "all",
            "",
        ] {
            assert!(validate_ip_or_cidr(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_header_name() {
        assert!(validate_header_name("X-Test").is_ok());
        assert!(validate_header_name("X-Custom-123").is_ok());
        assert!(validate_header_name("").is_err());
        assert!(validate_header_name("X Test").is_err());
        assert!(validate_header_name("X-Test:").is_err());
        assert!(validate_header_name("X_Test").is_err());
        assert!(validate_header_name("X-Test\r\n").is_err());
    }

    #[test]
    fn test_header_value_strict_rejects_line_breaks() {
        assert!(validate_header_value("Value").is_ok());
        assert!(validate_header_value("max-age=0; \"quoted\"").is_ok());

        let err = validate_header_value("a\r\nSet-Cookie: x=y").unwrap_err();
        assert!(matches!(err, ValidationError::HeaderInjection { .. }));
        assert!(validate_header_value("a\nb").is_err());
        assert!(validate_header_value("a\rb").is_err());
        assert!(validate_header_value("a\u{0}b").is_err());
        assert!(validate_header_value("a\tb").is_err());
    }

    #[test]
    fn test_sanitize_header_value_strips_line_breaks() {
        assert_eq!(
            sanitize_header_value("abc\r\ndef").unwrap().as_str(),
            "abcdef"
        );
        // Other control characters survive stripping and are rejected
        assert!(sanitize_header_value("abc\u{7}").is_err());
    }

    #[test]
    fn test_header_value_rejects_nginx_variables() {
        for value in ["$http_authorization", "session=$cookie_session", "${host}"] {
            let err = validate_header_value(value).unwrap_err();
            assert!(matches!(err, ValidationError::HeaderValue { .. }), "{value:?}");
        }
        // Stripping line breaks does not let a variable through
        assert!(sanitize_header_value("\r\n$remote_addr").is_err());
        assert!(validate_header_value("price: 5 USD").is_ok());
    }

    #[test]
    fn test_identifier() {
        assert!(validate_identifier("default-pool").is_ok());
        assert!(validate_identifier("pool_1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("pool name").is_err());
        assert!(validate_identifier("pool;").is_err());
        assert!(validate_identifier(&"p".repeat(64)).is_err());
    }

    #[test]
    fn test_managed_filename_round_trip() {
        let slug = validate_slug("acme").unwrap();
        let host = validate_hostname("acme.example.com").unwrap();
        let name = managed_filename(&slug, &host);
        assert_eq!(name, "acme_acme.example.com.conf");

        let (s, h) = parse_managed_filename(&name).unwrap();
        assert_eq!(s, slug);
        assert_eq!(h, host);
    }

    #[test]
    fn test_foreign_files_are_not_managed() {
        assert!(parse_managed_filename("default.conf").is_none());
        assert!(parse_managed_filename("nginx.conf").is_none());
        assert!(parse_managed_filename("acme_example.com.conf.bak").is_none());
        assert!(parse_managed_filename("acme_Example.com.conf").is_none());
        assert!(parse_managed_filename("../acme_example.com.conf").is_none());
        assert!(parse_managed_filename("acme_../../etc/passwd.conf").is_none());
        assert!(parse_managed_filename("ab_example.com.conf").is_none());
    }
}
