//! Data-driven classification of mobile routes.
//!
//! Sensitive operations (those requiring a request signature) are an ordered
//! table of (method, path-glob) rules. `*` matches exactly one path segment,
//! a trailing `**` matches the rest of the path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestClass {
    Auth,
    Sensitive,
    ApiGeneral,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Auth => "auth",
            RequestClass::Sensitive => "sensitive",
            RequestClass::ApiGeneral => "api_general",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRule {
    pub method: String,
    pub pattern: String,
}

impl OperationRule {
    pub fn new(method: &str, pattern: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            pattern: pattern.to_string(),
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && glob_match(&self.pattern, path)
    }
}

#[derive(Debug, Clone)]
pub struct RouteRules {
    sensitive: Vec<OperationRule>,
    auth_prefix: String,
}

impl RouteRules {
    pub fn new(sensitive: Vec<OperationRule>) -> Self {
        Self {
            sensitive,
            auth_prefix: "/mobile/auth/".to_string(),
        }
    }

    /// The default allow-list of operations that must carry a signature.
    pub fn default_rules() -> Self {
        Self::new(vec![
            OperationRule::new("POST", "/mobile/users"),
            OperationRule::new("PUT", "/mobile/users/*"),
            OperationRule::new("DELETE", "/mobile/users/*"),
            OperationRule::new("POST", "/mobile/devices/trust"),
            OperationRule::new("DELETE", "/mobile/devices/**"),
            OperationRule::new("POST", "/mobile/auth/logout"),
        ])
    }

    pub fn is_sensitive(&self, method: &str, path: &str) -> bool {
        self.sensitive.iter().any(|r| r.matches(method, path))
    }

    pub fn classify(&self, method: &str, path: &str) -> RequestClass {
        if path.starts_with(&self.auth_prefix) {
            RequestClass::Auth
        } else if self.is_sensitive(method, path) {
            RequestClass::Sensitive
        } else {
            RequestClass::ApiGeneral
        }
    }
}

fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segs: Vec<&str> = path.trim_matches('/').split('/').collect();

    let mut pi = 0;
    for (i, seg) in pattern_segs.iter().enumerate() {
        if *seg == "**" {
            // Trailing ** swallows the remainder, including nothing.
            return i == pattern_segs.len() - 1;
        }
        if pi >= path_segs.len() {
            return false;
        }
        if *seg != "*" && *seg != path_segs[pi] {
            return false;
        }
        pi += 1;
    }
    pi == path_segs.len()
}
