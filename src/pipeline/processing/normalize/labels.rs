/// Trim, collapse internal whitespace, then title-case.
pub fn normalize_label(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    title_case(&collapsed)
}

/// Upper-case the first letter of every alphabetic run and lower-case the
/// rest. Any non-letter (digit, apostrophe, bracket) starts a new run, so
/// `"o'neil"` becomes `"O'Neil"` and `"so18"` becomes `"So18"`.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for ch in s.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}
