/// Strips vendor decoration such as `[Phone]` from an advertised device name.
///
/// Everything up to and including the last `]` following the first `[` is
/// dropped and the remainder trimmed. Names without a bracketed tag, or whose
/// remainder would be empty, are returned unchanged.
pub fn normalize(raw_name: &str) -> String {
    let Some(open) = raw_name.find('[') else {
        return raw_name.to_string();
    };
    let Some(close) = raw_name[open..].rfind(']') else {
        return raw_name.to_string();
    };

    let trailing = raw_name[open + close + 1..].trim();
    if trailing.is_empty() {
        return raw_name.to_string();
    }

    tracing::debug!(raw = raw_name, fixed = trailing, "Device name normalized");
    trailing.to_string()
}

/// Case folding shared by every identity comparison: names, addresses and
/// correlation keys. Covers non-ASCII letters, unlike `eq_ignore_ascii_case`.
pub fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

pub fn eq_fold(a: &str, b: &str) -> bool {
    a == b || fold_case(a) == fold_case(b)
}
