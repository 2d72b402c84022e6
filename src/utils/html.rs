/// Clean HTML content using the ammonia library.
///
/// Whitelist-based: keeps safe structural tags (like <h1>, <p>, <strong>)
/// and strips dangerous tags (like <script>, <iframe>) and event attributes.
/// Applied to every rendered certificate before it is stored.
pub fn clean_html(input: &str) -> String {
    ammonia::clean(input)
}

/// Escapes untrusted text for embedding in HTML (course titles, codes).
pub fn escape_text(input: &str) -> String {
    ammonia::clean_text(input)
}
