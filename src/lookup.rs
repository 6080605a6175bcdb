//! Filename existence checks against the share directory, isolated in
//! a child process so a filesystem error (a missing directory, a
//! permission problem) can never poison the servent's own state.
//!
//! The child is the same binary re-invoked with a hidden flag; it
//! performs the scan and exits with status `1` if the file is present,
//! `0` otherwise — the natural analogue of the one-byte pipe result a
//! forked child would write back to its parent.

use std::path::{Path, PathBuf};

pub const CHECK_FILE_FLAG: &str = "--check-file";

/// Runs the re-exec'd lookup and returns whether `name` exists directly
/// under `share_dir`. Creates `share_dir` (mode 0777 on unix) if it is
/// absent; a lookup that still fails after creation reports "not found"
/// rather than propagating the I/O error, per the error handling design.
pub async fn file_exists(share_dir: PathBuf, name: String) -> bool {
    tokio::task::spawn_blocking(move || file_exists_blocking(&share_dir, &name))
        .await
        .unwrap_or(false)
}

fn file_exists_blocking(share_dir: &Path, name: &str) -> bool {
    ensure_share_dir(share_dir);

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(_) => return scan_directly(share_dir, name),
    };

    let status = std::process::Command::new(exe)
        .arg(CHECK_FILE_FLAG)
        .arg(share_dir)
        .arg(name)
        .status();

    match status {
        Ok(status) => status.code() == Some(1),
        Err(_) => scan_directly(share_dir, name),
    }
}

fn scan_directly(share_dir: &Path, name: &str) -> bool {
    share_dir.join(name).is_file()
}

fn ensure_share_dir(share_dir: &Path) {
    if share_dir.is_dir() {
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let _ = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(share_dir);
    }
    #[cfg(not(unix))]
    {
        let _ = std::fs::create_dir_all(share_dir);
    }
}

/// Entry point for the re-exec'd child: `servent --check-file <dir> <name>`.
/// Exits 1 if found, 0 otherwise. Never returns.
pub fn run_check_file_subcommand(dir: &str, name: &str) -> ! {
    let found = scan_directly(Path::new(dir), name);
    std::process::exit(if found { 1 } else { 0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        assert!(file_exists(dir.path().to_path_buf(), "f".to_string()).await);
    }

    #[tokio::test]
    async fn missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!file_exists(dir.path().to_path_buf(), "nope".to_string()).await);
    }

    #[tokio::test]
    async fn creates_share_dir_lazily() {
        let parent = tempfile::tempdir().unwrap();
        let share_dir = parent.path().join("share");
        assert!(!share_dir.exists());
        assert!(!file_exists(share_dir.clone(), "f".to_string()).await);
        assert!(share_dir.is_dir());
    }
}
