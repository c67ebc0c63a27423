use std::path::{Component, Path, PathBuf};

/// Lexically resolve `.` and `..` without touching the filesystem, so paths
/// to templates that do not exist yet still normalize.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::Normal(segment) => out.push(segment),
            Component::RootDir => out.push(component.as_os_str()),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
        }
    }

    out
}

/// Resolve a path written in a stack file against the stack's directory.
pub fn resolve_stack_relative(base: &Path, raw: &str) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        normalize_path(&candidate)
    } else {
        normalize_path(&base.join(candidate))
    }
}
