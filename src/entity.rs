use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static EMAIL_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "You"),
            Sender::Bot => write!(f, "Assistant"),
        }
    }
}

/// The visitor behind a conversation, captured by the identification form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            phone: phone.into(),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

/// Checks the identification form. Errors are ordered: name first, then email.
pub fn validate_identification_form(name: &str, email: &str) -> Validation {
    let mut errors = Vec::new();

    if name.trim().is_empty() {
        errors.push("Name is required".to_string());
    }

    let email = email.trim();
    if email.is_empty() {
        errors.push("Email address is required".to_string());
    } else if !EMAIL_SHAPE.is_match(email) {
        errors.push("Please enter a valid email address".to_string());
    }

    Validation {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_identity() {
        let result = validate_identification_form("Jo", "jo@x.com");
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn empty_name_is_reported_before_email_problems() {
        let result = validate_identification_form("   ", "not-an-email");
        assert!(!result.valid);
        assert_eq!(
            result.errors,
            vec!["Name is required", "Please enter a valid email address"]
        );
        assert_eq!(result.first_error(), Some("Name is required"));
    }

    #[test]
    fn missing_email_has_its_own_message() {
        let result = validate_identification_form("Jo", "");
        assert_eq!(result.first_error(), Some("Email address is required"));
    }

    #[test]
    fn rejects_malformed_emails() {
        for email in ["jo@", "jo@x", "jo x@y.com", "@x.com", "jo@@x.com"] {
            let result = validate_identification_form("Jo", email);
            assert!(!result.valid, "{email} should be rejected");
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert!(validate_identification_form(" Jo ", "  jo@x.com ").valid);
    }
}
