//! Path handling ahead of a tree walk.

const SYSTEM_ROOT: &str = "/system_root";

/// Prefixes whose paths consult the system rule set first.
const SYSTEM_PREFIXES: &[&str] = &[
    "/system/",
    "/product/",
    "/apex/",
    "/system_ext/",
    "/postinstall/system/",
];

/// Strip a leading `/system_root` when the system partition is mounted there.
pub fn normalize(path: &str, system_root_mounted: bool) -> &str {
    if !system_root_mounted {
        return path;
    }
    match path.strip_prefix(SYSTEM_ROOT) {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

pub fn is_system_path(path: &str) -> bool {
    SYSTEM_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Split an absolute path into its components.
///
/// Returns `None` for relative paths, for `/` itself, and for any path with
/// an empty component (`//`, trailing `/`).
pub fn components(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(parts)
}
