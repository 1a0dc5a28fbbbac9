//! Route matching logic.
//!
//! # Responsibilities
//! - Match the virtual host (exact, `*.suffix` or `*`, case-insensitive)
//! - Match the path prefix (case-sensitive), detecting the missing trailing
//!   slash case that should redirect
//!
//! # Design Decisions
//! - Host patterns are lowercased once, at construction
//! - Path matching is a plain prefix test, no regex

/// Host condition of a route entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `*`: any host.
    Any,
    /// `*.suffix`: the suffix itself or any dot-separated subdomain of it.
    Subdomains(String),
    /// Exact host name.
    Exact(String),
}

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        if pattern == "*" {
            Self::Any
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            Self::Subdomains(suffix.to_string())
        } else {
            Self::Exact(pattern)
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(expected) => host == *expected,
            Self::Subdomains(suffix) => {
                if !host.ends_with(suffix.as_str()) {
                    return false;
                }
                if host.len() == suffix.len() {
                    return true;
                }
                host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            }
        }
    }
}

/// How a path relates to a route prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// The path lies under the prefix.
    Prefix,
    /// The path is the prefix minus its trailing slash.
    Redirect,
}

/// Compare a request path against a route prefix.
pub fn match_path(prefix: &str, path: &str) -> Option<PathMatch> {
    if prefix.len() > path.len() {
        let is_dir = prefix.len() == path.len() + 1
            && prefix.ends_with('/')
            && prefix.starts_with(path);
        return is_dir.then_some(PathMatch::Redirect);
    }
    path.starts_with(prefix).then_some(PathMatch::Prefix)
}
