//! LoopMounter - `mount -o loop` / `umount` を使う本番用 Mounter
//!
//! Needs root (or an equivalent capability). Mount state is read from
//! `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::ports::{MountError, Mounter};
use crate::process::Cmd;

#[derive(Debug, Clone)]
pub struct LoopMounter {
    mountinfo: PathBuf,
}

impl LoopMounter {
    pub fn new() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl Default for LoopMounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount points listed in a mountinfo table (field 5).
///
/// Spaces and other special characters are octal-escaped by the kernel.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|p| PathBuf::from(unescape_octal(p)))
}

fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\' && i + 3 < bytes.len())
            .then(|| &bytes[i + 1..i + 4])
            .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|d| {
                let v = d.iter().fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                u8::try_from(v).ok()
            });
        if let Some(v) = escaped {
            out.push(v);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// mountinfo には正規化済みパスが載るので、比較前に canonicalize する
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl Mounter for LoopMounter {
    async fn is_mounted(&self, mount_dir: &Path) -> Result<bool, MountError> {
        let table = tokio::fs::read_to_string(&self.mountinfo).await?;
        let target = canonical(mount_dir);
        Ok(mount_points(&table).any(|p| p == target))
    }

    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), MountError> {
        Cmd::new("mount")
            .args(["-o", "loop"])
            .arg(image)
            .arg(mount_dir)
            .error_msg(format!("mount {} failed", image.display()))
            .run()
            .await
            .map_err(|e| MountError::Command(e.to_string()))?;
        Ok(())
    }

    async fn unmount(&self, mount_dir: &Path) -> Result<(), MountError> {
        Cmd::new("umount")
            .arg(mount_dir)
            .error_msg(format!("umount {} failed", mount_dir.display()))
            .run()
            .await
            .map_err(|e| MountError::Command(e.to_string()))?;
        Ok(())
    }

    fn unmount_blocking(&self, mount_dir: &Path) -> Result<(), MountError> {
        let status = std::process::Command::new("umount").arg(mount_dir).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(MountError::Command(format!(
                "umount {} exited with {status}",
                mount_dir.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 7:0 / /work/abc123/image/mnt rw,relatime shared:50 - ext4 /dev/loop0 rw
99 22 7:1 / /work/with\\040space/mnt rw,relatime shared:51 - ext4 /dev/loop1 rw
";

    #[test]
    fn parses_mount_points() {
        let points: Vec<_> = mount_points(MOUNTINFO).collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/work/abc123/image/mnt"),
                PathBuf::from("/work/with space/mnt"),
            ]
        );
    }

    #[test]
    fn unescape_leaves_plain_text_alone() {
        assert_eq!(unescape_octal("/a/b"), "/a/b");
        assert_eq!(unescape_octal("/a\\011b"), "/a\tb");
        assert_eq!(unescape_octal("trailing\\"), "trailing\\");
    }

    #[tokio::test]
    async fn reads_the_configured_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mountinfo");
        let mnt = dir.path().join("mnt");
        std::fs::create_dir(&mnt).unwrap();
        let canon = std::fs::canonicalize(&mnt).unwrap();
        std::fs::write(
            &table,
            format!("98 22 7:0 / {} rw - ext4 /dev/loop0 rw\n", canon.display()),
        )
        .unwrap();

        let mounter = LoopMounter { mountinfo: table };
        assert!(mounter.is_mounted(&mnt).await.unwrap());
        assert!(!mounter.is_mounted(dir.path()).await.unwrap());
    }
}
