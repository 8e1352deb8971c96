//! Shared utility functions used across multiple modules.

/// Truncate text to at most 180 characters for status and error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}
