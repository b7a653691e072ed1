//! Security/technical error classification.

use crate::model::ErrorCategory;

/// Substrings that mark a failure as security relevant.
const SECURITY_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "permission",
    "access denied",
    "security",
    "auth",
    "login",
    "password",
    "token",
    "403",
    "401",
    "rate limit",
    "suspicious",
    "malicious",
    "attack",
    "intrusion",
    "injection",
    "xss",
    "csrf",
    "brute force",
];

/// Classify an error by case-insensitive keyword match over `type message`.
/// Anything that matches no keyword is `Technical`.
pub fn classify_error(error_type: &str, error_message: &str) -> ErrorCategory {
    let text = format!("{} {}", error_type, error_message).to_lowercase();
    if SECURITY_KEYWORDS.iter().any(|keyword| text.contains(keyword)) {
        ErrorCategory::Security
    } else {
        ErrorCategory::Technical
    }
}
