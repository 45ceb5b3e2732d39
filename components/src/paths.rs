//! POSIX path handling for paths inside containers. These never touch the
//! local filesystem, so they are plain strings rather than `Path`s.

use crate::error::ComponentFailure;

/// Joins `relative` onto the absolute directory `root`, normalizing `.` and
/// `..`. The result must stay within `root`. A trailing `/` on `relative` is
/// preserved so directory prefixes stay recognizable.
pub fn safe_join(root: &str, relative: &str) -> Result<String, ComponentFailure> {
    let escape = || ComponentFailure::PathEscape {
        path: relative.to_string(),
        root: root.to_string(),
    };
    if !root.starts_with('/') {
        return Err(escape());
    }

    let base: Vec<&str> = root.split('/').filter(|p| !p.is_empty()).collect();
    let mut parts = base.clone();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.len() <= base.len() {
                    return Err(escape());
                }
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if relative.starts_with('/') {
        return Err(escape());
    }

    let mut joined = format!("/{}", parts.join("/"));
    if (relative.ends_with('/') || relative.is_empty()) && !joined.ends_with('/') {
        joined.push('/');
    }
    Ok(joined)
}

/// `child` relative to `root`, both absolute and normalized.
pub fn strip_root<'a>(root: &str, child: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches('/');
    child
        .strip_prefix(root)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .map(|rest| rest.trim_start_matches('/'))
}

pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Every ancestor directory of `relative`, shortest first, each with a
/// trailing `/`.
pub fn parent_dirs(relative: &str) -> Vec<String> {
    let parts: Vec<&str> = relative
        .trim_end_matches('/')
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    (1..parts.len())
        .map(|n| format!("{}/", parts[..n].join("/")))
        .collect()
}
