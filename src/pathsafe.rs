use std::path::{Component, Path, PathBuf};

use crate::error::EngineError;

/// Validate one attachment path against the allow-listed roots.
///
/// Purely lexical: `..` components are rejected before any comparison, so a
/// path can never climb out of a root it nominally starts under. Relative
/// paths are resolved against the first root. The file does not need to
/// exist — the CLIs report missing files themselves.
pub fn validate_attachment(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, EngineError> {
    let escape = || EngineError::PathEscape {
        path: path.display().to_string(),
    };

    if roots.is_empty() {
        return Err(escape());
    }

    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(escape());
    }

    let resolved = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&roots[0].join(path))
    };

    for root in roots {
        let root = normalize(root);
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(escape())
}

/// Validate a whole attachment list, failing on the first escape.
pub fn validate_attachments(
    paths: &[PathBuf],
    roots: &[PathBuf],
) -> Result<Vec<PathBuf>, EngineError> {
    paths
        .iter()
        .map(|p| validate_attachment(p, roots))
        .collect()
}

/// Lexical normalization: drop `.` components, keep everything else as-is.
/// `..` never reaches here (rejected above), so no popping is needed.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> Vec<PathBuf> {
        vec![PathBuf::from("/work/repo"), PathBuf::from("/tmp/scratch")]
    }

    #[test]
    fn test_relative_path_resolves_under_first_root() {
        let out = validate_attachment(Path::new("src/main.rs"), &roots()).unwrap();
        assert_eq!(out, PathBuf::from("/work/repo/src/main.rs"));
    }

    #[test]
    fn test_absolute_path_inside_root_accepted() {
        let out = validate_attachment(Path::new("/tmp/scratch/notes.md"), &roots()).unwrap();
        assert_eq!(out, PathBuf::from("/tmp/scratch/notes.md"));
    }

    #[test]
    fn test_absolute_path_outside_roots_rejected() {
        let err = validate_attachment(Path::new("/etc/passwd"), &roots()).unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn test_parent_dir_component_rejected() {
        assert!(validate_attachment(Path::new("src/../../etc/passwd"), &roots()).is_err());
        // Even a `..` that would stay inside the root is rejected.
        assert!(validate_attachment(Path::new("src/../src/main.rs"), &roots()).is_err());
    }

    #[test]
    fn test_cur_dir_components_normalized() {
        let out = validate_attachment(Path::new("./src/./lib.rs"), &roots()).unwrap();
        assert_eq!(out, PathBuf::from("/work/repo/src/lib.rs"));
    }

    #[test]
    fn test_prefix_sibling_does_not_match_root() {
        // "/work/repo-evil" must not pass the "/work/repo" root check.
        let err =
            validate_attachment(Path::new("/work/repo-evil/x.rs"), &roots()).unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn test_empty_roots_reject_everything() {
        assert!(validate_attachment(Path::new("anything"), &[]).is_err());
    }

    #[test]
    fn test_validate_list_fails_fast() {
        let paths = vec![PathBuf::from("ok.rs"), PathBuf::from("/etc/shadow")];
        assert!(validate_attachments(&paths, &roots()).is_err());

        let paths = vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")];
        let out = validate_attachments(&paths, &roots()).unwrap();
        assert_eq!(out.len(), 2);
    }
}
