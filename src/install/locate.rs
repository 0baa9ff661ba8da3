//! Executable discovery inside an extracted install tree.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Normalize to lower-case with `/` separators for suffix comparison.
fn normalize(s: &str) -> String {
    s.replace('\\', "/").to_lowercase()
}

/// Whether `candidate` (relative to the walk root) satisfies `target`.
///
/// The basename must match case-insensitively, the path must end with the
/// target's suffix, and the character before that suffix must be a separator
/// (or the suffix must be the whole path). `author-nvm.exe` therefore never
/// matches `nvm.exe`, while `bin/nvm.exe` does.
pub fn matches_target(candidate: &Path, target: &str) -> bool {
    let target = normalize(target.trim_start_matches(['/', '\\']));
    if target.is_empty() {
        return false;
    }
    let target_base = target.rsplit('/').next().unwrap_or(&target);
    let candidate_base = candidate
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if candidate_base != target_base {
        return false;
    }

    let path = normalize(&candidate.to_string_lossy());
    if !path.ends_with(&target) {
        return false;
    }
    let prefix_len = path.len() - target.len();
    prefix_len == 0 || path.as_bytes()[prefix_len - 1] == b'/'
}

/// Shallowest file under `root` matching `target`, ties broken by path order.
pub fn find_executable(root: &Path, target: &str) -> Option<PathBuf> {
    let mut found: Vec<(usize, PathBuf)> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            matches_target(rel, target)
        })
        .map(|e| (e.depth(), e.into_path()))
        .collect();
    found.sort();
    found.into_iter().next().map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"").unwrap();
    }

    #[test]
    fn separator_must_precede_suffix() {
        assert!(matches_target(Path::new("nvm.exe"), "nvm.exe"));
        assert!(matches_target(Path::new("bin/nvm.exe"), "nvm.exe"));
        assert!(matches_target(Path::new("tools/BIN/NVM.EXE"), "bin/nvm.exe"));
        assert!(!matches_target(Path::new("author-nvm.exe"), "nvm.exe"));
        assert!(!matches_target(Path::new("x/author-nvm.exe"), "nvm.exe"));
        assert!(!matches_target(Path::new("sbin/mysqld.exe"), "bin/mysqld.exe"));
        assert!(!matches_target(Path::new("bin/mysqld.exe"), ""));
    }

    #[test]
    fn find_skips_lookalikes() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "nvm/author-nvm.exe");
        touch(dir.path(), "nvm/bin/nvm.exe");

        let found = find_executable(dir.path(), "nvm.exe").unwrap();
        assert_eq!(found, dir.path().join("nvm/bin/nvm.exe"));
    }

    #[test]
    fn find_prefers_shallowest_match() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "mysql-8.4.0/bin/mysqld.exe");
        touch(dir.path(), "mysql-8.4.0/lib/plugin/debug/bin/mysqld.exe");
        touch(dir.path(), "mysql-8.4.0/bin/mysql.exe");

        assert_eq!(
            find_executable(dir.path(), "bin/mysqld.exe").unwrap(),
            dir.path().join("mysql-8.4.0/bin/mysqld.exe")
        );
        assert_eq!(
            find_executable(dir.path(), "bin/mysql.exe").unwrap(),
            dir.path().join("mysql-8.4.0/bin/mysql.exe")
        );
        assert!(find_executable(dir.path(), "mongod.exe").is_none());
    }
}
