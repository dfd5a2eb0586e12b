//! Credential protection for connection strings, logs and subprocesses.
//!
//! # Security Guarantees
//! - Credentials are stored in `Zeroizing` containers for automatic memory clearing
//! - Passwords are masked in connection strings and bcp command lines before logging
//!
//! # Module Structure
//! - `credentials`: Secure credential container with automatic memory zeroing
//! - `redact`: Connection string and argument masking

mod credentials;
mod redact;

pub use credentials::Credentials;
pub use redact::{mask_password_args, redact_connection_string};
