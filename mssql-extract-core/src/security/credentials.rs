//! Secure credential container with automatic memory zeroing.
//!
//! # Security
//! - Credentials are stored in `Zeroizing<T>` containers
//! - Memory is automatically cleared when credentials go out of scope
//! - The password never appears in `Debug` output or logs

use serde::Deserialize;
use zeroize::{Zeroize, Zeroizing};

/// SQL Server login that zeros its memory on drop.
///
/// # Example
///
/// ```rust
/// use mssql_extract_core::security::Credentials;
///
/// let creds = Credentials::new("sa".to_string(), "secret".to_string());
/// assert_eq!(creds.username(), "sa");
/// assert!(!format!("{creds:?}").contains("secret"));
/// ```
#[derive(Clone, Zeroize, Deserialize)]
#[zeroize(drop)]
#[serde(from = "CredentialsRepr")]
pub struct Credentials {
    username: Zeroizing<String>,
    password: Zeroizing<String>,
}

/// On-disk shape of the login: `user` and `#password` (or plain `password`).
#[derive(Deserialize)]
struct CredentialsRepr {
    user: String,
    #[serde(rename = "#password", alias = "password")]
    password: String,
}

impl From<CredentialsRepr> for Credentials {
    fn from(repr: CredentialsRepr) -> Self {
        Self::new(repr.user, repr.password)
    }
}

impl Credentials {
    /// Creates new credentials with automatic memory zeroing.
    pub fn new(username: String, password: String) -> Self {
        Self {
            username: Zeroizing::new(username),
            password: Zeroizing::new(password),
        }
    }

    /// Gets the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Exposes the password for the single place that must send it:
    /// the login packet and the bcp argument list.
    pub fn expose_password(&self) -> &str {
        &self.password
    }

    /// Checks if a password is present without exposing it.
    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username.as_str())
            .field("password", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = Credentials::new("testuser".to_string(), "testpass".to_string());
        assert_eq!(creds.username(), "testuser");
        assert_eq!(creds.expose_password(), "testpass");
        assert!(creds.has_password());
    }

    #[test]
    fn test_credentials_empty_password() {
        let creds = Credentials::new("testuser".to_string(), String::new());
        assert!(!creds.has_password());
    }

    #[test]
    fn test_debug_masks_password() {
        let creds = Credentials::new("admin".to_string(), "hunter2".to_string());
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_hash_prefixed_password() {
        let creds: Credentials =
            serde_json::from_str(r##"{"user": "reader", "#password": "s3cret"}"##).unwrap();
        assert_eq!(creds.username(), "reader");
        assert_eq!(creds.expose_password(), "s3cret");
    }

    #[test]
    fn test_deserialize_plain_password() {
        let creds: Credentials =
            serde_json::from_str(r#"{"user": "reader", "password": "s3cret"}"#).unwrap();
        assert_eq!(creds.expose_password(), "s3cret");
    }
}
