//! Input validation and sanitization functions for curfew
//!
//! Everything written into the hosts file or passed to `nft` goes through
//! here first, so a hostile label or domain can neither break the file
//! format nor smuggle extra tokens into a rule.

/// Sanitizes a label for safe use in hosts comments and nftables comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use curfew::validators::sanitize_label;
///
/// let safe = sanitize_label("Twitter / X");
/// assert_eq!(safe, "Twitter  X");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(64)
        .collect()
}

/// Validates and sanitizes a permanent-block label.
///
/// # Errors
///
/// Returns `Err` if:
/// - Label exceeds 64 characters
/// - Label is empty, or becomes empty after sanitization
pub fn validate_label(input: &str) -> Result<String, String> {
    let input = input.trim();
    if input.len() > 64 {
        return Err("Label too long (max 64 characters)".to_string());
    }

    let sanitized = sanitize_label(input);

    if sanitized.trim().is_empty() {
        return Err("Label cannot be empty".to_string());
    }

    Ok(sanitized)
}

/// Validates a domain name for a hosts-file entry and returns it lowercased.
///
/// Accepts RFC 1123 host names: dot-separated labels of ASCII letters,
/// digits and hyphens, each 1-63 chars and not starting or ending with a
/// hyphen, 253 chars total. Wildcards are rejected because the hosts file
/// cannot express them.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_domain(input: &str) -> Result<String, String> {
    let domain = input.trim().trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() {
        return Err("Domain cannot be empty".to_string());
    }
    if domain.len() > 253 {
        return Err("Domain too long (max 253 characters)".to_string());
    }
    if domain.contains('*') {
        return Err("Wildcards are not supported by the hosts file".to_string());
    }
    if !domain.contains('.') {
        return Err(format!("'{domain}' is not a fully qualified domain"));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("'{domain}' has an empty or oversized label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("'{domain}' has a label starting or ending with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("'{domain}' contains invalid characters"));
        }
    }

    Ok(domain)
}

/// Validates a hosts marker tag (`YOUTUBE`, `PERMANENT`, ...).
///
/// # Errors
///
/// Returns `Err` unless the tag is 1-32 ASCII uppercase letters, digits or `_`.
pub fn validate_marker_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() || tag.len() > 32 {
        return Err("Marker tag must be 1-32 characters".to_string());
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(format!("Marker tag '{tag}' must use A-Z, 0-9 and _ only"));
    }
    Ok(())
}

/// Validates a platform id, which also becomes part of a file name.
///
/// # Errors
///
/// Returns `Err` unless the id is 1-32 chars of `a-z`, `0-9`, `-`, `_`.
pub fn validate_platform_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 32 {
        return Err("Platform id must be 1-32 characters".to_string());
    }
    if id == "." || id == ".." {
        return Err("Invalid platform id".to_string());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
    {
        return Err(format!("Platform id '{id}' must use a-z, 0-9, - and _ only"));
    }
    Ok(())
}
