/// Get environment variable with COACHLINE_ prefix, falling back to unprefixed version
///
/// Checks `COACHLINE_{key}` first, then `{key}`, so platform-provided
/// variables such as `PORT` keep working.
///
/// # Examples
///
/// ```rust
/// use coachline::utils::get_env_with_prefix;
///
/// // Checks COACHLINE_WEBHOOK_SECRET first, then WEBHOOK_SECRET
/// let secret = get_env_with_prefix("WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("COACHLINE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Comma-separated list variable, e.g. `COACHLINE_PLACEHOLDER_PLAYERS=guest,demo`.
///
/// Entries are trimmed and blanks dropped.
pub fn get_env_list_with_prefix(key: &str) -> Option<Vec<String>> {
    get_env_with_prefix(key).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}
