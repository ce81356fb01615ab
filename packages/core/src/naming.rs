//! Helpers for composing queue and namespace names.

/// Normalize an identifier into a queue-safe name.
///
/// Every non-word character becomes `_` and the result is lowercased, so
/// `"My App"` becomes `"my_app"`.
pub fn normalize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

/// Derive a queue namespace from a (possibly module-qualified) class name.
///
/// `Billing::Invoice` maps to `billing`; a name with a single segment maps to
/// the shared `worker` namespace.
pub fn namespace_from_class(class_name: &str) -> String {
    let pieces: Vec<&str> = class_name.split("::").collect();
    if pieces.len() < 2 {
        return "worker".to_string();
    }
    underscore(pieces[0])
}

/// Join a namespace and a queue name into the full queue name.
pub fn full_queue_name(namespace: &str, queue: &str) -> String {
    format!("{}_{}", namespace, queue)
}

/// Convert a CamelCase segment into snake_case.
pub fn underscore(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    let chars: Vec<char> = segment.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if prev_lower || (prev_upper && next_lower) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if *c == '-' {
            out.push('_');
        } else {
            out.push(*c);
        }
    }
    out
}
