//! MIME helpers.

/// Lowercases and strips parameters (`text/plain; charset=utf-8` -> `text/plain`).
pub fn normalize_mime(mime: &str) -> Option<String> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let (kind, sub) = essence.split_once('/')?;
    if kind.is_empty() || sub.is_empty() {
        return None;
    }
    Some(essence)
}

/// Guesses a MIME type from a file name's extension.
pub fn guess_mime(name: &str) -> Option<String> {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Matches `mime` against a pattern such as `image/*`, `*/*` or `text/x-vcard`.
pub fn mime_matches(pattern: &str, mime: &str) -> bool {
    let (Some(pattern), Some(mime)) = (normalize_mime(pattern), normalize_mime(mime)) else {
        return false;
    };
    let (p_kind, p_sub) = pattern.split_once('/').unwrap_or((&pattern, ""));
    let (m_kind, m_sub) = mime.split_once('/').unwrap_or((&mime, ""));
    (p_kind == "*" || p_kind == m_kind) && (p_sub == "*" || p_sub == m_sub)
}
