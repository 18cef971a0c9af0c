//! Remote path helpers
//!
//! Remote SFTP paths always use `/` as separator, whatever the local OS.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    let component = component.trim_start_matches('/');
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Final component of a remote path
pub fn remote_base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Path of `full` relative to `base`, or `None` if `full` is not below `base`
pub fn relative_remote_path<'a>(base: &str, full: &'a str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    let rest = full.strip_prefix(base)?;
    if base.is_empty() {
        return Some(rest.trim_start_matches('/'));
    }
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Every ancestor of `path` plus `path` itself, shortest first
///
/// `/opt/lab/bin` → `["/opt", "/opt/lab", "/opt/lab/bin"]`. Used to emulate
/// `mkdir -p` over SFTP.
pub fn remote_dir_chain(path: &str) -> Vec<String> {
    let absolute = is_absolute_remote_path(path);
    let mut current = String::new();
    let mut chain = Vec::new();

    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if current.is_empty() {
            current = if absolute {
                format!("/{}", segment)
            } else {
                segment.to_string()
            };
        } else {
            current = join_remote_path(&current, segment);
        }
        chain.push(current.clone());
    }

    chain
}
