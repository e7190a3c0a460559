use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

pub(crate) const KEY_FILE_MODE: u32 = 0o600;
pub(crate) const CHAIN_FILE_MODE: u32 = 0o644;

/// Ensures the settings directory exists.
pub(crate) async fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path).await
}

/// Writes `contents` to `path` with the given mode and flushes it to disk
/// before returning. Renewal recovery depends on completed writes being
/// durable, so every write here ends in `sync_all`.
pub(crate) async fn write_durable(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_durable(path, contents, KEY_FILE_MODE).await
}

pub(crate) async fn write_public(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_durable(path, contents, CHAIN_FILE_MODE).await
}
