// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
Running the pipeline inside an isolation root.

The root filesystem is extracted from a prebuilt worker archive into the
build directory. On a regular build the output and spec directories are
bind mounted into the root; in container environments, where bind mounts
are unavailable, their contents are copied in before the run and the
output copied back afterwards.
*/

use {
    anyhow::{Context, Result},
    flate2::read::GzDecoder,
    nix::mount::{MntFlags, MsFlags},
    slog::warn,
    srpm_packaging::fs as fsutil,
    std::{
        fs::File,
        os::unix::io::AsRawFd,
        path::{Path, PathBuf},
    },
};

const CHROOT_NAME: &str = "srpmpacker_chroot";

const OUT_MOUNT_POINT: &str = "/output";
const SPECS_MOUNT_POINT: &str = "/specs";
const BUILD_DIR_IN_CHROOT: &str = "/build";

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Whether this environment supports bind mounts.
///
/// Container builds cannot bind mount, so directory contents are copied
/// across the isolation-root boundary instead.
pub fn is_regular_build() -> bool {
    if let Ok(value) = std::env::var("SRPMPACKER_BUILD_ENV") {
        if value == "container" {
            return false;
        }
    }

    !Path::new("/.dockerenv").exists()
}

/// Resolve an in-root absolute path to its location on the host.
pub fn path_inside_root(root_dir: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root_dir.join(relative),
        Err(_) => root_dir.join(path),
    }
}

/// An isolation root on disk, with any bind mounts into it.
pub struct Chroot {
    root_dir: PathBuf,
    bind_mount_targets: Vec<PathBuf>,
}

/// A constructed isolation root plus the pipeline directories as seen from
/// inside it.
pub struct CreatedChroot {
    pub chroot: Chroot,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub specs_dir: PathBuf,
}

/// Build an isolation root for packing under `build_dir`.
pub fn create_chroot(
    logger: &slog::Logger,
    worker_tar: &Path,
    build_dir: &Path,
    out_dir: &Path,
    specs_dir: &Path,
) -> Result<CreatedChroot> {
    let root_dir = build_dir.join(CHROOT_NAME);

    let mut chroot = Chroot {
        root_dir,
        bind_mount_targets: Vec::new(),
    };

    if let Err(e) = initialize_chroot(&mut chroot, worker_tar, out_dir, specs_dir) {
        chroot.close(logger);
        return Err(e);
    }

    Ok(CreatedChroot {
        chroot,
        build_dir: PathBuf::from(BUILD_DIR_IN_CHROOT),
        out_dir: PathBuf::from(OUT_MOUNT_POINT),
        specs_dir: PathBuf::from(SPECS_MOUNT_POINT),
    })
}

fn initialize_chroot(
    chroot: &mut Chroot,
    worker_tar: &Path,
    out_dir: &Path,
    specs_dir: &Path,
) -> Result<()> {
    if chroot.root_dir.exists() {
        std::fs::remove_dir_all(&chroot.root_dir).with_context(|| {
            format!("removing stale isolation root {}", chroot.root_dir.display())
        })?;
    }
    std::fs::create_dir_all(&chroot.root_dir).with_context(|| {
        format!("creating isolation root {}", chroot.root_dir.display())
    })?;

    extract_worker_archive(worker_tar, &chroot.root_dir)?;

    std::fs::create_dir_all(path_inside_root(
        &chroot.root_dir,
        Path::new(BUILD_DIR_IN_CHROOT),
    ))
    .context("creating the in-root build directory")?;

    if is_regular_build() {
        chroot.bind_mount(out_dir, OUT_MOUNT_POINT)?;
        chroot.bind_mount(specs_dir, SPECS_MOUNT_POINT)?;
    } else {
        // Copy in all of the SPECs so they can be packed.
        fsutil::copy_directory_contents(
            specs_dir,
            &path_inside_root(&chroot.root_dir, Path::new(SPECS_MOUNT_POINT)),
        )
        .context("copying specs into the isolation root")?;

        // Copy any prepacked SRPMs so they will not be repacked.
        fsutil::copy_directory_contents(
            out_dir,
            &path_inside_root(&chroot.root_dir, Path::new(OUT_MOUNT_POINT)),
        )
        .context("copying prepacked SRPMs into the isolation root")?;
    }

    // Networking support is needed to download sources.
    fsutil::copy_file(
        Path::new(RESOLV_CONF),
        &path_inside_root(&chroot.root_dir, Path::new(RESOLV_CONF)),
    )
    .context("copying resolv.conf into the isolation root")?;

    Ok(())
}

/// Extract a gzip compressed worker archive into the root directory.
fn extract_worker_archive(worker_tar: &Path, root_dir: &Path) -> Result<()> {
    let file = File::open(worker_tar)
        .with_context(|| format!("opening worker archive {}", worker_tar.display()))?;

    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive
        .unpack(root_dir)
        .with_context(|| format!("extracting worker archive {}", worker_tar.display()))?;

    Ok(())
}

impl Chroot {
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn bind_mount(&mut self, source: &Path, mount_point: &str) -> Result<()> {
        let target = path_inside_root(&self.root_dir, Path::new(mount_point));
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating mount point {}", target.display()))?;

        nix::mount::mount(
            Some(source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "bind mounting {} at {}",
                source.display(),
                target.display()
            )
        })?;

        self.bind_mount_targets.push(target);

        Ok(())
    }

    /// Execute a closure with this root as the process root directory.
    ///
    /// The original root is restored before returning, whether or not the
    /// closure succeeded.
    pub fn run<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let saved_root =
            File::open("/").context("opening / before entering the isolation root")?;

        nix::unistd::chroot(&self.root_dir)
            .with_context(|| format!("entering isolation root {}", self.root_dir.display()))?;
        std::env::set_current_dir("/")
            .context("changing directory into the isolation root")?;

        let run_result = f();

        let escape_result = (|| -> Result<()> {
            nix::unistd::fchdir(saved_root.as_raw_fd())
                .context("returning to the original root directory")?;
            nix::unistd::chroot(".").context("restoring the original root")?;
            std::env::set_current_dir("/")?;
            Ok(())
        })();

        run_result.and(escape_result)
    }

    /// Tear the isolation root down: unmount everything, then delete it.
    pub fn close(&self, logger: &slog::Logger) {
        for target in self.bind_mount_targets.iter().rev() {
            if let Err(e) = nix::mount::umount2(target, MntFlags::MNT_DETACH) {
                warn!(
                    logger,
                    "Failed to unmount ({}), err: {}",
                    target.display(),
                    e
                );
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.root_dir) {
            warn!(
                logger,
                "Failed to remove isolation root ({}), err: {}",
                self.root_dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_path_inside_root() {
        let root = Path::new("/build/srpmpacker_chroot");

        assert_eq!(
            path_inside_root(root, Path::new("/output")),
            PathBuf::from("/build/srpmpacker_chroot/output")
        );
        assert_eq!(
            path_inside_root(root, Path::new("relative/dir")),
            PathBuf::from("/build/srpmpacker_chroot/relative/dir")
        );
    }

    #[test]
    fn test_extract_worker_archive() {
        let td = tempfile::Builder::new()
            .prefix("srpmpacker-test")
            .tempdir()
            .unwrap();

        // Assemble a one-file worker archive.
        let archive_path = td.path().join("worker.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let data = b"nameserver 127.0.0.1\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "etc/hosts.fixture", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        }

        let root_dir = td.path().join("root");
        std::fs::create_dir_all(&root_dir).unwrap();
        extract_worker_archive(&archive_path, &root_dir).unwrap();

        assert_eq!(
            std::fs::read(root_dir.join("etc/hosts.fixture")).unwrap(),
            b"nameserver 127.0.0.1\n"
        );
    }
}
