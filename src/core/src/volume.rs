use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Fixed-size image file loop-mounted over a runtime volume, capping the
/// disk space an instance can use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDisk {
    pub image: PathBuf,
    pub mount_point: PathBuf,
    pub size_mb: u64,
    pub filesystem: String,
}

/// Prepares the host directories bind-mounted into containers.
#[async_trait]
pub trait VolumePreparer: Send + Sync {
    /// Creates `path` if needed and hands it to `uid:gid`.
    async fn ensure(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Deletes `path` recursively. A missing directory is not an error.
    async fn remove(&self, path: &Path) -> io::Result<()>;

    /// Creates and formats the disk image on first use, then mounts it over
    /// its mount point unless something is mounted there already.
    async fn ensure_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()>;

    /// Unmounts the disk if mounted and deletes its image.
    async fn remove_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()>;
}

/// [`VolumePreparer`] working on the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FsVolumePreparer;

impl FsVolumePreparer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VolumePreparer for FsVolumePreparer {
    async fn ensure(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await?;

        let output = Command::new("chown")
            .arg("-R")
            .arg(format!("{}:{}", uid, gid))
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("chown of {} failed: {}", path.display(), stderr.trim());
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("chown {}:{} {}: {}", uid, gid, path.display(), stderr.trim()),
            ));
        }

        debug!("Volume {} ready for {}:{}", path.display(), uid, gid);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!("Removed volume {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()> {
        if tokio::fs::metadata(&disk.image).await.is_err() {
            if let Some(parent) = disk.image.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(
                "Creating virtual disk {} ({} MB)",
                disk.image.display(),
                disk.size_mb
            );
            let image = tokio::fs::File::create(&disk.image).await?;
            image
                .set_len(disk.size_mb.saturating_mul(BYTES_PER_MIB))
                .await?;
            drop(image);

            let image = path_arg(&disk.image);
            if let Err(e) = run("mkfs", &["-t", disk.filesystem.as_str(), image.as_str()]).await {
                // An unformatted image would be picked up as ready on the next call.
                let _ = tokio::fs::remove_file(&disk.image).await;
                return Err(e);
            }
        }

        tokio::fs::create_dir_all(&disk.mount_point).await?;
        if !is_mounted(&disk.mount_point).await? {
            run(
                "mount",
                &[
                    "-t",
                    "auto",
                    "-o",
                    "loop",
                    path_arg(&disk.image).as_str(),
                    path_arg(&disk.mount_point).as_str(),
                ],
            )
            .await?;
            debug!(
                "Mounted {} on {}",
                disk.image.display(),
                disk.mount_point.display()
            );
        }
        Ok(())
    }

    async fn remove_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()> {
        if tokio::fs::metadata(&disk.mount_point).await.is_ok()
            && is_mounted(&disk.mount_point).await?
        {
            run("umount", &[path_arg(&disk.mount_point).as_str()]).await?;
        }
        match tokio::fs::remove_file(&disk.image).await {
            Ok(()) => {
                debug!("Removed virtual disk {}", disk.image.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `findmnt` exits non-zero when nothing is mounted on `path`.
async fn is_mounted(path: &Path) -> io::Result<bool> {
    let output = Command::new("findmnt")
        .arg("--mountpoint")
        .arg(path)
        .output()
        .await?;
    Ok(output.status.success())
}

async fn run(program: &str, args: &[&str]) -> io::Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("{} {}: {}", program, args.join(" "), stderr.trim()),
    ))
}
