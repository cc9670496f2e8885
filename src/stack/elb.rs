//! Load balancer names from their DNS hostnames.
//!
//! The load balancer controller names internal load balancers
//! `<prefix><name>-<suffix>.<region>.elb.amazonaws.com`, where the suffix is
//! a random token the platform appends. The hostname is the only handle the
//! ingress exposes, so the name has to be parsed back out of it.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,

    #[error("hostname '{0}' has no domain")]
    NoDomain(String),

    #[error("hostname '{0}' has an empty label")]
    EmptyLabel(String),

    #[error("load balancer label '{0}' has no random suffix")]
    NoSuffix(String),

    #[error("load balancer label '{0}' ends in '{1}', which is not a random suffix")]
    BadSuffix(String, String),
}

/// Derives the load balancer name from its hostname.
///
/// Takes the first DNS label, strips `prefix` if present and drops the last
/// `-`-separated segment.
///
/// ```rust
/// use kumo::stack::elb::load_balancer_name;
///
/// let name = load_balancer_name("internal-abc123-456789.elb.amazonaws.com", "internal-");
/// assert_eq!(name.unwrap(), "abc123");
/// ```
pub fn load_balancer_name(hostname: &str, prefix: &str) -> Result<String, HostnameError> {
    let hostname = hostname.trim().trim_end_matches('.');
    if hostname.is_empty() {
        return Err(HostnameError::Empty);
    }

    let Some((label, domain)) = hostname.split_once('.') else {
        return Err(HostnameError::NoDomain(hostname.to_owned()));
    };
    if label.is_empty() || domain.split('.').any(str::is_empty) {
        return Err(HostnameError::EmptyLabel(hostname.to_owned()));
    }

    let token = label.strip_prefix(prefix).unwrap_or(label);
    let Some((name, suffix)) = token.rsplit_once('-') else {
        return Err(HostnameError::NoSuffix(token.to_owned()));
    };
    if name.is_empty() {
        return Err(HostnameError::NoSuffix(token.to_owned()));
    }
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(HostnameError::BadSuffix(token.to_owned(), suffix.to_owned()));
    }

    Ok(name.to_owned())
}
