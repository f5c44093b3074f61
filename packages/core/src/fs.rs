use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `bytes` so readers see either the old or the new file
pub(crate) async fn write_atomic(path: &Path, bytes: Vec<u8>) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
        }

        file.persist(&path).map_err(|err| err.error)?;
        Ok(())
    })
    .await
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
}

/// Stage `bytes` in a temp file that is removed when dropped
pub(crate) fn stage_temp(bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("configurator-validate.")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}
