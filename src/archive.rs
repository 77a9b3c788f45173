//! Workspace export — packages a checkout into a .tar.gz for delivery.

use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::ArchiveError;

/// Directories never included in an export.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

/// Pack `workdir` into `<out_dir>/<name>-export.tar.gz` and return the
/// archive path. The tar walk is synchronous, so it runs on the blocking
/// pool.
pub async fn export_workspace(workdir: &Path, out_dir: &Path) -> Result<PathBuf, ArchiveError> {
    tokio::fs::create_dir_all(out_dir).await?;

    let name = workdir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string();
    let archive_path = out_dir.join(format!("{name}-export.tar.gz"));

    let src = workdir.to_path_buf();
    let dst = archive_path.clone();
    tokio::task::spawn_blocking(move || pack(&src, &dst, &name))
        .await
        .map_err(|e| ArchiveError::Pack(format!("archive task failed: {e}")))??;

    Ok(archive_path)
}

fn pack(src: &Path, dst: &Path, root_name: &str) -> Result<(), ArchiveError> {
    let file = std::fs::File::create(dst)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_dir(&mut builder, src, Path::new(root_name))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| ArchiveError::Pack(e.to_string()))?;
    encoder.finish()?;
    Ok(())
}

fn append_dir(
    builder: &mut tar::Builder<GzEncoder<std::fs::File>>,
    dir: &Path,
    prefix: &Path,
) -> Result<(), ArchiveError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        let archived = prefix.join(name_str);

        if entry.file_type()?.is_dir() {
            if SKIPPED_DIRS.contains(&name_str) {
                continue;
            }
            append_dir(builder, &path, &archived)?;
        } else if entry.file_type()?.is_file() {
            builder
                .append_path_with_name(&path, &archived)
                .map_err(|e| ArchiveError::Pack(e.to_string()))?;
        }
    }
    Ok(())
}
