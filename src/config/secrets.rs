//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for comparing the shared
//! worker token without exposing it.

pub use secrecy::{ExposeSecret, SecretString};

/// Whether a presented bearer token matches the configured one.
///
/// Compares every byte so timing does not reveal the matching prefix.
pub fn token_matches(expected: &SecretString, presented: &str) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
