//! Artifact Extractor
//!
//! Copies things into a mounted image (kernel headers, the reproducer) and
//! pulls results back out (vmcore, console log). Every step tolerates a
//! partially completed earlier run: copies go through a `.partial` file and
//! a rename, and already-relocated results are picked up again.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::{Artifact, ReproError};
use crate::mount::MountedRoot;
use crate::workspace::{TRIGGER_FILE_NAME, WorkspacePaths, blocking};

/// Header directories replaced inside the image.
pub const HEADER_DIRS: [&str; 2] = ["asm", "linux"];

/// Where the crash kernel writes its dump, relative to the image root.
pub const VMCORE_IN_IMAGE: &str = "var/crash/vmcore";

const TRIGGER_MODE: u32 = 0o755;
const WORLD_READABLE: u32 = 0o644;

#[derive(Debug, Clone)]
pub struct ArtifactExtractor {
    /// Home directory inside the image that receives the trigger, relative
    /// to the image root (`root` -> `/root/bug`).
    trigger_home: PathBuf,
}

impl Default for ArtifactExtractor {
    fn default() -> Self {
        Self::new("root")
    }
}

impl ArtifactExtractor {
    pub fn new(trigger_home: impl Into<PathBuf>) -> Self {
        Self {
            trigger_home: trigger_home.into(),
        }
    }

    /// Copy the template image to the task's own `debian.img`, once.
    ///
    /// Returns `false` when the task already has its copy.
    pub async fn prepare_image(
        &self,
        template: &Path,
        paths: &WorkspacePaths,
    ) -> Result<bool, ReproError> {
        let template = template.to_path_buf();
        let image = paths.image_path.clone();
        blocking(move || {
            if image.is_file() {
                return Ok(false);
            }
            if !template.is_file() {
                return Err(ReproError::ImageNotFound(template));
            }
            info!(template = %template.display(), image = %image.display(), "copying template image");
            copy_atomic(&template, &image)
                .map_err(|e| ReproError::io(format!("copy {}", template.display()), e))?;
            Ok(true)
        })
        .await
    }

    /// Replace `usr/include/{asm,linux}` in the image with the freshly
    /// installed headers.
    pub async fn inject_headers(
        &self,
        root: &MountedRoot,
        paths: &WorkspacePaths,
    ) -> Result<(), ReproError> {
        let headers = paths.headers_dir();
        let include = root.join("usr/include")?;
        blocking(move || {
            // Both trees must exist before either is replaced.
            if let Some(missing) = HEADER_DIRS
                .iter()
                .map(|name| headers.join(name))
                .find(|src| !src.is_dir())
            {
                return Err(ReproError::HeaderCopyFailed(format!(
                    "{} is missing; headers_install has not run",
                    missing.display()
                )));
            }
            for name in HEADER_DIRS {
                let src = headers.join(name);
                let dst = include.join(name);
                replace_tree(&src, &dst).map_err(|e| {
                    let route = format!("{} -> {}", src.display(), dst.display());
                    ReproError::HeaderCopyFailed(format!("{route}: {e}"))
                })?;
                debug!(dst = %dst.display(), "headers injected");
            }
            Ok(())
        })
        .await
    }

    /// Place the reproducer in the image's home directory, executable.
    pub async fn inject_trigger(
        &self,
        root: &MountedRoot,
        paths: &WorkspacePaths,
    ) -> Result<PathBuf, ReproError> {
        let src = paths.trigger_path.clone();
        let home = root.join(&self.trigger_home)?;
        blocking(move || {
            if !src.is_file() {
                return Err(ReproError::TriggerCopyFailed(format!(
                    "{} does not exist",
                    src.display()
                )));
            }
            let dst = home.join(TRIGGER_FILE_NAME);
            let copy = || -> io::Result<()> {
                fs::create_dir_all(&home)?;
                copy_atomic(&src, &dst)?;
                fs::set_permissions(&dst, fs::Permissions::from_mode(TRIGGER_MODE))
            };
            copy().map_err(|e| ReproError::TriggerCopyFailed(format!("{}: {e}", dst.display())))?;
            info!(trigger = %dst.display(), "reproducer injected");
            Ok(dst)
        })
        .await
    }

    /// Move a crash dump out of the image into `build/vmcore`.
    ///
    /// `None` means no crash was observed. A dump relocated by an earlier,
    /// interrupted run is reported again.
    pub async fn collect_vmcore(
        &self,
        root: &MountedRoot,
        paths: &WorkspacePaths,
    ) -> Result<Option<Artifact>, ReproError> {
        let src = root.join(VMCORE_IN_IMAGE)?;
        let dest = paths.vmcore_dest();
        blocking(move || {
            let io_err = |e| ReproError::io(format!("relocate {}", src.display()), e);
            if src.is_file() {
                copy_atomic(&src, &dest).map_err(io_err)?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(WORLD_READABLE))
                    .map_err(io_err)?;
                fs::remove_file(&src).map_err(io_err)?;
                info!(vmcore = %dest.display(), "crash dump collected");
                return Ok(Some(Artifact::at(dest)));
            }
            if dest.is_file() {
                debug!(vmcore = %dest.display(), "crash dump already relocated");
                fs::set_permissions(&dest, fs::Permissions::from_mode(WORLD_READABLE))
                    .map_err(io_err)?;
                return Ok(Some(Artifact::at(dest)));
            }
            info!("no crash dump in image");
            Ok(None)
        })
        .await
    }

    /// Move `image/vm.log` to `build/vm.log`. A missing log is not an error.
    pub async fn relocate_log(
        &self,
        paths: &WorkspacePaths,
    ) -> Result<Option<PathBuf>, ReproError> {
        let src = paths.log_path.clone();
        let dest = paths.log_dest();
        blocking(move || {
            if !src.is_file() {
                return Ok(dest.is_file().then_some(dest));
            }
            let io_err = |e| ReproError::io(format!("relocate {}", src.display()), e);
            move_file(&src, &dest).map_err(io_err)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(WORLD_READABLE))
                .map_err(io_err)?;
            debug!(log = %dest.display(), "console log relocated");
            Ok(Some(dest))
        })
        .await
    }
}

/// Copy via `<dst>.partial` + rename so `dst` is either absent or complete.
fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let mut partial = dst.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    fs::copy(src, &partial)?;
    fs::rename(&partial, dst)
}

/// rename, falling back to copy + remove across filesystems.
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            copy_atomic(src, dst)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

fn replace_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::symlink_metadata(dst).is_ok() {
        if dst.is_dir() {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }
    copy_tree(src, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Revision, TaskId};

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: WorkspacePaths,
        root: MountedRoot,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(
            dir.path(),
            &TaskId::parse("abc123").unwrap(),
            &Revision::parse("deadbeef").unwrap(),
        );
        paths.create_dirs().unwrap();
        let root = MountedRoot::for_tests(&paths.mount_dir);
        Fixture {
            _dir: dir,
            paths,
            root,
        }
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn install_headers(paths: &WorkspacePaths) {
        let include = paths.headers_dir();
        fs::create_dir_all(include.join("asm")).unwrap();
        fs::create_dir_all(include.join("linux/netfilter")).unwrap();
        fs::write(include.join("asm/unistd.h"), "new asm").unwrap();
        fs::write(include.join("linux/netfilter/x.h"), "new nf").unwrap();
    }

    #[tokio::test]
    async fn headers_replace_what_the_image_had() {
        let f = fixture();
        install_headers(&f.paths);
        let stale = f.root.join("usr/include/linux/removed.h").unwrap();
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "old").unwrap();

        let x = ArtifactExtractor::default();
        x.inject_headers(&f.root, &f.paths).await.unwrap();
        // 二回目も同じ結果
        x.inject_headers(&f.root, &f.paths).await.unwrap();

        assert!(!stale.exists());
        assert_eq!(
            fs::read_to_string(f.root.join("usr/include/asm/unistd.h").unwrap()).unwrap(),
            "new asm"
        );
        assert!(f.root.join("usr/include/linux/netfilter/x.h").unwrap().is_file());
    }

    #[tokio::test]
    async fn headers_missing_is_header_copy_failed() {
        let f = fixture();
        let err = ArtifactExtractor::default()
            .inject_headers(&f.root, &f.paths)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::HeaderCopyFailed(_)));
    }

    #[tokio::test]
    async fn partial_headers_leave_the_image_untouched() {
        let f = fixture();
        let include = f.paths.headers_dir();
        fs::create_dir_all(include.join("asm")).unwrap();
        fs::write(include.join("asm/unistd.h"), "new asm").unwrap();
        let old_asm = f.root.join("usr/include/asm/unistd.h").unwrap();
        fs::create_dir_all(old_asm.parent().unwrap()).unwrap();
        fs::write(&old_asm, "old asm").unwrap();

        let err = ArtifactExtractor::default()
            .inject_headers(&f.root, &f.paths)
            .await
            .unwrap_err();

        assert!(matches!(err, ReproError::HeaderCopyFailed(ref m) if m.contains("linux")));
        assert_eq!(fs::read_to_string(&old_asm).unwrap(), "old asm");
    }

    #[tokio::test]
    async fn trigger_home_outside_the_image_is_refused() {
        let f = fixture();
        fs::write(&f.paths.trigger_path, b"\x7fELF").unwrap();

        let result = ArtifactExtractor::new("../../..")
            .inject_trigger(&f.root, &f.paths)
            .await;

        assert!(result.is_err());
        let outside = f.paths.work_dir.parent().unwrap().join(TRIGGER_FILE_NAME);
        assert!(!outside.exists());
    }

    #[tokio::test]
    async fn trigger_lands_in_home_and_is_executable() {
        let f = fixture();
        fs::write(&f.paths.trigger_path, b"\x7fELF").unwrap();

        let dst = ArtifactExtractor::default()
            .inject_trigger(&f.root, &f.paths)
            .await
            .unwrap();

        assert_eq!(dst, f.paths.mount_dir.join("root/bug"));
        assert_eq!(fs::read(&dst).unwrap(), b"\x7fELF");
        assert_eq!(mode(&dst), 0o755);
    }

    #[tokio::test]
    async fn trigger_missing_is_trigger_copy_failed() {
        let f = fixture();
        let err = ArtifactExtractor::new("home/syz")
            .inject_trigger(&f.root, &f.paths)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::TriggerCopyFailed(_)));
    }

    #[tokio::test]
    async fn vmcore_is_moved_to_build_and_world_readable() {
        let f = fixture();
        let src = f.root.join(VMCORE_IN_IMAGE).unwrap();
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"dump").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o600)).unwrap();

        let x = ArtifactExtractor::default();
        let artifact = x.collect_vmcore(&f.root, &f.paths).await.unwrap().unwrap();

        let dest = f.paths.build_dir.join("vmcore");
        assert_eq!(artifact.path(), dest);
        assert_eq!(artifact.name, "vmcore");
        assert_eq!(fs::read(&dest).unwrap(), b"dump");
        assert_eq!(mode(&dest) & 0o444, 0o444);
        assert!(!src.exists());
        assert!(!dest.with_file_name("vmcore.partial").exists());

        // 再実行しても同じ artifact
        let again = x.collect_vmcore(&f.root, &f.paths).await.unwrap();
        assert_eq!(again, Some(artifact));
    }

    #[tokio::test]
    async fn no_vmcore_is_none() {
        let f = fixture();
        let got = ArtifactExtractor::default()
            .collect_vmcore(&f.root, &f.paths)
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn log_is_relocated_and_absence_is_fine() {
        let f = fixture();
        let x = ArtifactExtractor::default();
        assert_eq!(x.relocate_log(&f.paths).await.unwrap(), None);

        fs::write(&f.paths.log_path, "Kernel panic").unwrap();
        let moved = x.relocate_log(&f.paths).await.unwrap().unwrap();
        assert_eq!(moved, f.paths.build_dir.join("vm.log"));
        assert!(!f.paths.log_path.exists());
        assert_eq!(mode(&moved), 0o644);

        assert_eq!(x.relocate_log(&f.paths).await.unwrap(), Some(moved));
    }

    #[tokio::test]
    async fn template_is_copied_once() {
        let f = fixture();
        let template = f._dir.path().join("template.img");
        fs::write(&template, b"v1").unwrap();
        let x = ArtifactExtractor::default();

        assert!(x.prepare_image(&template, &f.paths).await.unwrap());
        fs::write(&template, b"v2").unwrap();
        assert!(!x.prepare_image(&template, &f.paths).await.unwrap());
        assert_eq!(fs::read(&f.paths.image_path).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn missing_template_is_image_not_found() {
        let f = fixture();
        let err = ArtifactExtractor::default()
            .prepare_image(Path::new("/nonexistent/template.img"), &f.paths)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::ImageNotFound(_)));
    }
}
