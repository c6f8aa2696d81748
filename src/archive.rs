//! Copy files in and out of containers as uncompressed tar streams.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use log::debug;

use crate::error::{DeployError, Result};
use crate::runtime::ContainerHandle;

/// Bytes moved per read while extracting a file.
const CHUNK_SIZE: usize = 10240;

/// Build a tar stream holding `local` under the name `remote` (relative to
/// the container root).  Directories are only descended into when
/// `recursive` is set.
pub fn pack(local: &Path, remote: &str, recursive: bool) -> Result<Vec<u8>> {
    let name = remote.trim_start_matches('/');
    if name.is_empty() {
        return Err(DeployError::InvalidSpec(format!(
            "cannot copy {} onto the container root",
            local.display()
        )));
    }
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let meta = fs::symlink_metadata(local)?;
    if meta.is_dir() {
        if recursive {
            builder.append_dir_all(name, local)?;
        } else {
            builder.append_dir(name, local)?;
        }
    } else {
        builder.append_path_with_name(local, name)?;
    }
    Ok(builder.into_inner()?)
}

/// Extract the regular files of `archive` below `dest`, dropping the first
/// path component of every entry.  Returns the written paths.
pub fn unpack(archive: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(target) = strip_first_component(&path, dest) else {
            debug!("Skipping archive entry {}", path.display());
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        written.push(target);
    }
    Ok(written)
}

/// `dest` joined with everything after the first component of `path`.
/// Entries escaping `dest` yield `None`.
fn strip_first_component(path: &Path, dest: &Path) -> Option<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in path.components().skip(1) {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(target)
}

fn join_error(e: tokio::task::JoinError) -> DeployError {
    DeployError::Io(std::io::Error::other(e))
}

/// Upload `local` to `remote` inside the container in a single call.
pub async fn copy_to(
    container: &ContainerHandle,
    local: &Path,
    remote: &str,
    recursive: bool,
) -> Result<()> {
    debug!(
        "Copying {} to {}:{}",
        local.display(),
        container.service,
        remote
    );
    let local_path = local.to_path_buf();
    let name = remote.to_string();
    let archive = tokio::task::spawn_blocking(move || pack(&local_path, &name, recursive))
        .await
        .map_err(join_error)??;
    container
        .runtime
        .upload_archive(&container.id, "/", Bytes::from(archive))
        .await
}

/// Download `remote` from the container and mirror it at `local`.
pub async fn copy_from(
    container: &ContainerHandle,
    remote: &str,
    local: &Path,
) -> Result<Vec<PathBuf>> {
    let archive = container
        .runtime
        .download_archive(&container.id, remote)
        .await?;
    let dest = local.to_path_buf();
    let written = tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .map_err(join_error)??;
    for path in &written {
        debug!("Extracted {}:{} to {}", container.service, remote, path.display());
    }
    Ok(written)
}
