//! Name filters applied at the very top of the lookup pipeline.

/// Per-run user scripts are named `<username>_app.py`. They are the one
/// mutable input to a run, so they are always fetched fresh and never
/// cached, in the kernel or anywhere else.
pub fn is_script(name: &str) -> bool {
    match name.split('_').collect::<Vec<_>>().as_slice() {
        [username, "app.py"] => !username.is_empty(),
        _ => false,
    }
}

/// Python bytecode temp files churn on every import and never exist on
/// the blob server; refuse them without any I/O.
pub fn is_ignored(name: &str) -> bool {
    name.contains(".pyc.") || name.contains(".pyo.") || name == "__pycache__"
}
