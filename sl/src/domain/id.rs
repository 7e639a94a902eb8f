//! Run ID generation and identity keys
//!
//! Run IDs use the format `{12-hex-time}-{8-hex-random}` taken from a UUIDv7,
//! so they sort by creation time.
//! Identity keys are the slug of `{character}-{animation}` and prefix every
//! run folder name: `{identity-key}__{run-id}`.

/// Generate a fresh run ID
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    format!("{}-{}", &uuid[..12], &uuid[24..])
}

/// Identity key for a character + animation pair
pub fn identity_key(character: &str, animation: &str) -> String {
    slugify(&format!("{} {}", character, animation))
}

/// Slugify a title for use in IDs and folder names
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
