// # Credential Vault
//
// Encrypted credential store consulted by the client layer, plus the
// redaction engine that keeps those secrets out of every log line and event
// payload the core produces.

pub mod keystore;
pub mod redaction;

pub use keystore::{CipherKind, SecretString, Vault, VaultAccess, VaultConfig};
pub use redaction::Redactor;
