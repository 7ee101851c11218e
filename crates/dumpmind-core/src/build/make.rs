//! `make`-driven kernel build.
//!
//! ```text
//! make -C linux-<rev> O=build defconfig       (only without a reported config)
//! make -C linux-<rev> O=build olddefconfig
//! make -C linux-<rev> O=build CC=.. LD=.. -jN
//! make -C linux-<rev> O=build headers_install INSTALL_HDR_PATH=install
//! ```
//!
//! With `shell_nix` set, each line runs through
//! `nix-shell <shell.nix> --pure --argstr compiler <id> --run "<line>"`.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::build::kconfig;
use crate::domain::ReproError;
use crate::ports::{KernelArtifacts, KernelBuilder, PatchState};
use crate::process::{Cmd, CmdError};
use crate::toolchain::ToolchainDescriptor;
use crate::workspace::{WorkspacePaths, blocking, ensure_dir};

pub const BUILD_LOG_FILE_NAME: &str = "build.log";

#[derive(Debug, Clone)]
pub struct MakeKernelBuilder {
    shell_nix: Option<PathBuf>,
    kconfig: BTreeMap<String, String>,
    make: Vec<OsString>,
    patch: Vec<OsString>,
}

impl Default for MakeKernelBuilder {
    fn default() -> Self {
        Self {
            shell_nix: None,
            kconfig: BTreeMap::new(),
            make: vec!["make".into()],
            patch: vec!["patch".into()],
        }
    }
}

fn build_failed(e: CmdError) -> ReproError {
    ReproError::BuildFailed(e.to_string())
}

/// Single-quote `s` for `sh -c`.
fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl MakeKernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell_nix(mut self, shell_nix: Option<PathBuf>) -> Self {
        self.shell_nix = shell_nix;
        self
    }

    pub fn with_kconfig(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.kconfig = overrides;
        self
    }

    /// Replace the `make` program (and leading arguments).
    pub fn with_make_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.make = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_patch_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.patch = command.into_iter().map(Into::into).collect();
        self
    }

    /// One `make` invocation against the task's source and build dirs.
    fn make_cmd(
        &self,
        paths: &WorkspacePaths,
        toolchain: &ToolchainDescriptor,
        extra: &[String],
    ) -> Cmd {
        let mut args: Vec<String> = vec![
            "-C".into(),
            paths.src_dir.display().to_string(),
            format!("O={}", paths.build_dir.display()),
        ];
        args.extend(toolchain.make_args());
        args.extend(extra.iter().cloned());

        let cmd = match &self.shell_nix {
            Some(shell) => {
                let line = std::iter::once("make".to_string())
                    .chain(args)
                    .map(|a| sh_quote(&a))
                    .collect::<Vec<_>>()
                    .join(" ");
                Cmd::new("nix-shell").arg(shell).args([
                    "--pure",
                    "--argstr",
                    "compiler",
                    toolchain.id.as_str(),
                    "--run",
                    line.as_str(),
                ])
            }
            None => {
                let (program, lead) = split_program(&self.make);
                Cmd::new(program).args(lead).args(args)
            }
        };
        toolchain
            .binaries
            .iter()
            .fold(cmd, |cmd, (k, v)| cmd.env(k, v))
            .current_dir(&paths.src_dir)
    }

    fn patch_cmd(&self, paths: &WorkspacePaths, extra: &[&str]) -> Cmd {
        let (program, lead) = split_program(&self.patch);
        Cmd::new(program)
            .args(lead)
            .args(["-p1", "--batch"])
            .args(extra)
            .arg("-i")
            .arg(&paths.patch_path)
            .current_dir(&paths.src_dir)
            .allow_fail()
    }

    /// Seed `build/.config`: the reported config when present, else defconfig.
    async fn seed_config(
        &self,
        paths: &WorkspacePaths,
        toolchain: &ToolchainDescriptor,
    ) -> Result<(), ReproError> {
        let dot_config = paths.build_dir.join(".config");
        if dot_config.is_file() {
            return Ok(());
        }
        if paths.kernel_config_path.is_file() {
            debug!(from = %paths.kernel_config_path.display(), "using reported kernel config");
            let src = paths.kernel_config_path.clone();
            return blocking(move || {
                std::fs::copy(&src, &dot_config)
                    .map(|_| ())
                    .map_err(|e| ReproError::io(format!("copy {}", src.display()), e))
            })
            .await;
        }
        info!("no reported config, starting from defconfig");
        self.make_cmd(paths, toolchain, &["defconfig".into()])
            .error_msg("make defconfig failed")
            .run()
            .await
            .map_err(build_failed)?;
        Ok(())
    }
}

fn split_program(command: &[OsString]) -> (OsString, &[OsString]) {
    match command.split_first() {
        Some((program, lead)) => (program.clone(), lead),
        None => (OsString::from("make"), &[]),
    }
}

#[async_trait]
impl KernelBuilder for MakeKernelBuilder {
    async fn apply_patch(&self, paths: &WorkspacePaths) -> Result<PatchState, ReproError> {
        let conflict = |reason: String| ReproError::PatchConflict {
            patch: paths.patch_path.clone(),
            reason,
        };
        if !paths.patch_path.is_file() {
            return Err(conflict("patch file not found".into()));
        }
        let spawn = |e: CmdError| conflict(e.to_string());

        let forward = self
            .patch_cmd(paths, &["--forward", "--dry-run"])
            .run()
            .await
            .map_err(spawn)?;
        if forward.success() {
            self.patch_cmd(paths, &["--forward"])
                .run()
                .await
                .map_err(spawn)
                .and_then(|out| {
                    if out.success() {
                        Ok(())
                    } else {
                        Err(conflict(out.stdout.trim().to_string()))
                    }
                })?;
            info!(patch = %paths.patch_path.display(), "patch applied");
            return Ok(PatchState::Applied);
        }

        let reverse = self
            .patch_cmd(paths, &["--reverse", "--dry-run"])
            .run()
            .await
            .map_err(spawn)?;
        if reverse.success() {
            info!(patch = %paths.patch_path.display(), "patch already applied");
            return Ok(PatchState::AlreadyApplied);
        }

        Err(conflict(forward.stdout.trim().to_string()))
    }

    async fn build(
        &self,
        paths: &WorkspacePaths,
        toolchain: &ToolchainDescriptor,
    ) -> Result<KernelArtifacts, ReproError> {
        if !paths.src_dir.join("Makefile").is_file() {
            return Err(ReproError::BuildFailed(format!(
                "kernel source not found at {}",
                paths.src_dir.display()
            )));
        }
        ensure_dir(&paths.build_dir)?;
        ensure_dir(&paths.install_dir)?;

        self.seed_config(paths, toolchain).await?;

        let dot_config = paths.build_dir.join(".config");
        let overrides = self.kconfig.clone();
        blocking(move || {
            kconfig::apply_overrides(&dot_config, &overrides)
                .map_err(|e| ReproError::BuildFailed(format!("kernel config: {e}")))
        })
        .await?;

        self.make_cmd(paths, toolchain, &["olddefconfig".into()])
            .error_msg("make olddefconfig failed")
            .run()
            .await
            .map_err(build_failed)?;

        let log = paths.build_dir.join(BUILD_LOG_FILE_NAME);
        info!(toolchain = %toolchain.id, jobs = toolchain.parallelism, log = %log.display(), "building kernel");
        self.make_cmd(paths, toolchain, &[])
            .error_msg("kernel build failed")
            .run_logged(&log)
            .await
            .map_err(build_failed)?;

        let kernel_image = paths.kernel_image();
        if !kernel_image.is_file() {
            return Err(ReproError::BuildFailed(format!(
                "build finished but {} is missing",
                kernel_image.display()
            )));
        }

        self.make_cmd(
            paths,
            toolchain,
            &[
                "headers_install".into(),
                format!("INSTALL_HDR_PATH={}", paths.install_dir.display()),
            ],
        )
        .error_msg("make headers_install failed")
        .run()
        .await
        .map_err(build_failed)?;

        Ok(KernelArtifacts {
            kernel_image,
            headers_dir: paths.headers_dir(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Revision, TaskId};
    use crate::toolchain::{PackageSet, ToolchainResolver};
    use std::fs;

    /// Stand-in for `make` that records targets and produces the outputs a
    /// real kernel build would.
    const FAKE_MAKE: &str = r#"
for a in "$@"; do
  case "$a" in
    O=*) out="${a#O=}" ;;
    INSTALL_HDR_PATH=*) hdr="${a#INSTALL_HDR_PATH=}" ;;
    defconfig|olddefconfig|headers_install) target="$a" ;;
  esac
done
echo "${target:-all} CC=$CC" >> "$out/make.calls"
case "$target" in
  defconfig) echo "CONFIG_DEFAULT=y" > "$out/.config" ;;
  olddefconfig) ;;
  headers_install) mkdir -p "$hdr/include/asm" "$hdr/include/linux" ;;
  *) [ -n "$NO_BZIMAGE" ] || { mkdir -p "$out/arch/x86_64/boot" && echo kernel > "$out/arch/x86_64/boot/bzImage"; } ;;
esac
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        paths: WorkspacePaths,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(
            dir.path(),
            &TaskId::parse("abc123").unwrap(),
            &Revision::parse("deadbeef").unwrap(),
        );
        paths.create_dirs().unwrap();
        fs::create_dir_all(&paths.src_dir).unwrap();
        fs::write(paths.src_dir.join("Makefile"), "").unwrap();
        fs::write(dir.path().join("make.sh"), FAKE_MAKE).unwrap();
        Fixture { dir, paths }
    }

    fn gcc12() -> ToolchainDescriptor {
        ToolchainResolver::new(PackageSet::default(), 10)
            .resolve("gcc-12")
            .unwrap()
    }

    fn builder(f: &Fixture) -> MakeKernelBuilder {
        MakeKernelBuilder::new().with_make_command([
            OsString::from("sh"),
            f.dir.path().join("make.sh").into_os_string(),
        ])
    }

    fn calls(f: &Fixture) -> Vec<String> {
        fs::read_to_string(f.paths.build_dir.join("make.calls"))
            .unwrap()
            .lines()
            .map(|l| l.split(' ').next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn plain_make_command_line() {
        let f = fixture();
        let cmd = MakeKernelBuilder::new().make_cmd(&f.paths, &gcc12(), &["olddefconfig".into()]);
        let line = cmd.display();

        assert!(line.starts_with(&format!("make -C {}", f.paths.src_dir.display())));
        assert!(line.contains(&format!("O={}", f.paths.build_dir.display())));
        assert!(line.contains("CC=gcc"));
        assert!(line.contains("-j8"));
        assert!(line.ends_with("olddefconfig"));
    }

    #[test]
    fn nix_shell_wraps_the_whole_line() {
        let f = fixture();
        let cmd = MakeKernelBuilder::new()
            .with_shell_nix(Some(PathBuf::from("/srv/shell.nix")))
            .make_cmd(&f.paths, &gcc12(), &[]);
        let line = cmd.display();

        assert!(line.starts_with(
            "nix-shell /srv/shell.nix --pure --argstr compiler gcc-12 --run make -C "
        ));
        assert!(line.contains("CC=gcc"));
    }

    #[rstest::rstest]
    #[case::direct(None)]
    #[case::nix_shell(Some(PathBuf::from("/srv/shell.nix")))]
    fn toolchain_binaries_are_exported(#[case] shell_nix: Option<PathBuf>) {
        let f = fixture();
        let clang = ToolchainResolver::new(PackageSet::default(), 10)
            .resolve("clang-15")
            .unwrap();
        let cmd = MakeKernelBuilder::new()
            .with_shell_nix(shell_nix)
            .make_cmd(&f.paths, &clang, &[]);

        for (k, v) in &clang.binaries {
            assert_eq!(cmd.get_env(k), Some(std::ffi::OsStr::new(v)), "{k}");
        }
        assert_eq!(cmd.get_env("LD"), Some(std::ffi::OsStr::new("ld.lld")));
    }

    #[test]
    fn sh_quote_only_when_needed() {
        assert_eq!(sh_quote("O=/w/build"), "O=/w/build");
        assert_eq!(sh_quote("/w/with space"), "'/w/with space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn build_from_defconfig_produces_image_and_headers() {
        let f = fixture();
        let artifacts = builder(&f).build(&f.paths, &gcc12()).await.unwrap();

        assert_eq!(artifacts.kernel_image, f.paths.kernel_image());
        assert!(artifacts.kernel_image.is_file());
        assert!(artifacts.headers_dir.join("asm").is_dir());
        assert_eq!(
            calls(&f),
            vec!["defconfig", "olddefconfig", "all", "headers_install"]
        );
        let log = fs::read_to_string(f.paths.build_dir.join("make.calls")).unwrap();
        assert!(log.contains("CC=gcc"));
    }

    #[tokio::test]
    async fn reported_config_and_overrides_are_used() {
        let f = fixture();
        fs::write(&f.paths.kernel_config_path, "# CONFIG_KEXEC is not set\n").unwrap();

        let overrides = BTreeMap::from([("CONFIG_KEXEC".to_string(), "y".to_string())]);
        builder(&f)
            .with_kconfig(overrides)
            .build(&f.paths, &gcc12())
            .await
            .unwrap();

        assert_eq!(calls(&f), vec!["olddefconfig", "all", "headers_install"]);
        assert_eq!(
            fs::read_to_string(f.paths.build_dir.join(".config")).unwrap(),
            "CONFIG_KEXEC=y\n"
        );
    }

    #[tokio::test]
    async fn missing_bzimage_is_build_failed() {
        let f = fixture();
        let err = builder(&f)
            .with_make_command([
                OsString::from("env"),
                OsString::from("NO_BZIMAGE=1"),
                OsString::from("sh"),
                f.dir.path().join("make.sh").into_os_string(),
            ])
            .build(&f.paths, &gcc12())
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::BuildFailed(ref m) if m.contains("bzImage")));
    }

    #[tokio::test]
    async fn missing_source_is_build_failed() {
        let f = fixture();
        fs::remove_file(f.paths.src_dir.join("Makefile")).unwrap();
        let err = builder(&f).build(&f.paths, &gcc12()).await.unwrap_err();
        assert!(matches!(err, ReproError::BuildFailed(_)));
    }

    #[tokio::test]
    async fn failing_make_is_build_failed() {
        let f = fixture();
        let err = MakeKernelBuilder::new()
            .with_make_command(["false"])
            .build(&f.paths, &gcc12())
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::BuildFailed(ref m) if m.contains("defconfig")));
    }

    /// `patch` stand-in: forward applies once, reverse succeeds afterwards.
    const FAKE_PATCH: &str = r#"
dry=; rev=
for a in "$@"; do
  case "$a" in
    --dry-run) dry=1 ;;
    --reverse) rev=1 ;;
  esac
done
if grep -q CONFLICT patch.diff.src 2>/dev/null; then echo "Hunk #1 FAILED"; exit 1; fi
if [ -n "$rev" ]; then [ -f .applied ]; exit $?; fi
if [ -f .applied ]; then echo "Reversed (or previously applied) patch detected!"; exit 1; fi
[ -n "$dry" ] || touch .applied
"#;

    fn patcher(f: &Fixture) -> MakeKernelBuilder {
        fs::write(f.dir.path().join("patch.sh"), FAKE_PATCH).unwrap();
        MakeKernelBuilder::new().with_patch_command([
            OsString::from("sh"),
            f.dir.path().join("patch.sh").into_os_string(),
        ])
    }

    #[tokio::test]
    async fn patch_applies_then_is_recognised_as_applied() {
        let f = fixture();
        fs::write(&f.paths.patch_path, "--- a\n+++ b\n").unwrap();
        let b = patcher(&f);

        assert_eq!(b.apply_patch(&f.paths).await.unwrap(), PatchState::Applied);
        assert!(f.paths.src_dir.join(".applied").is_file());
        assert_eq!(
            b.apply_patch(&f.paths).await.unwrap(),
            PatchState::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn conflicting_patch_is_patch_conflict() {
        let f = fixture();
        fs::write(&f.paths.patch_path, "--- a\n+++ b\n").unwrap();
        fs::write(f.paths.src_dir.join("patch.diff.src"), "CONFLICT").unwrap();

        let err = patcher(&f).apply_patch(&f.paths).await.unwrap_err();
        match err {
            ReproError::PatchConflict { reason, .. } => assert!(reason.contains("FAILED")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_patch_file_is_patch_conflict() {
        let f = fixture();
        let err = patcher(&f).apply_patch(&f.paths).await.unwrap_err();
        assert!(matches!(err, ReproError::PatchConflict { .. }));
    }
}
