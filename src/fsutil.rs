//! Filesystem helpers shared by the local backend and the chunk cache.

use std::path::Path;

use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Returns a sibling temp path for `dest`, named `<dest>.<uuid>`.
pub fn temp_sibling(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".");
    name.push(Uuid::new_v4().to_string());
    std::path::PathBuf::from(name)
}

/// Moves `tmp` to `dest` without replacing an existing file at `dest`.
///
/// Rust's `std::fs::rename`/`tokio::fs::rename` always replaces an existing destination, so this
/// emulates a no-clobber rename with `hard_link` + `remove_file`: link `tmp` to `dest` (fails with
/// `AlreadyExists` if a concurrent writer already landed first), then remove the now-redundant
/// `tmp`. Failures are logged, not propagated — losing a race here just means falling back to
/// reading the winner's file, which is always correct.
pub async fn rename_no_replace(tmp: &Path, dest: &Path) {
    match fs::hard_link(tmp, dest).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(dest = %dest.display(), "lost rename race, destination already present");
        }
        Err(err) => {
            debug!(dest = %dest.display(), error = %err, "rename_no_replace link failed");
        }
    }

    if let Err(err) = fs::remove_file(tmp).await {
        debug!(tmp = %tmp.display(), error = %err, "failed to remove temp file after rename");
    }
}
