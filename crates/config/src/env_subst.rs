//! `${VAR}` expansion in raw config text.
//!
//! Deployment paths (workspace root, base image, storage) usually differ
//! per host, so they can be written as `${LABRUN_DATA}/images/base.sif`.
//!
//! - `${VAR}` expands to the variable, or stays verbatim when unset.
//! - `${VAR:-fallback}` expands to `fallback` when `VAR` is unset or empty.
//! - `$${` is an escaped literal `${`.

pub fn substitute_env(input: &str) -> String {
    expand(input, |name| std::env::var(name).ok())
}

fn expand(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            out.push_str("${");
            rest = after;
            continue;
        }
        let Some(body_start) = tail.strip_prefix("${") else {
            out.push('$');
            rest = &tail[1..];
            continue;
        };
        let Some(end) = body_start.find('}') else {
            // Unterminated: keep the remainder untouched.
            out.push_str(tail);
            return out;
        };

        let body = &body_start[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };
        match (lookup(name).filter(|v| !v.is_empty() || fallback.is_none()), fallback) {
            (Some(value), _) if !name.is_empty() => out.push_str(&value),
            (_, Some(fallback)) if !name.is_empty() => out.push_str(fallback),
            _ => out.push_str(&tail[..end + 3]),
        }
        rest = &body_start[end + 1..];
    }

    out.push_str(rest);
    out
}
