//! Runtime configuration.
//!
//! Loaded from `config/settings.toml` (or an explicit path). Every field has
//! a default, so a missing file or a partial file is fine.
//!
//! ```toml
//! workspace_root = "/srv/dumpmind/workspace"
//! template_image = "/srv/dumpmind/image/debian.img"
//! build_timeout_secs = 10800
//! shell_nix = "/srv/dumpmind/shell.nix"
//!
//! [toolchains]
//! gcc = [10, 11, 12, 13]
//! clang = [15, 16, 17]
//!
//! [kconfig]
//! CONFIG_KEXEC = "y"
//! CONFIG_CRASH_DUMP = "y"
//! CONFIG_DEBUG_INFO_BTF = "n"
//!
//! [reproducer]
//! program = "/srv/dumpmind/boot-vm.sh"
//! timeout_secs = 1800
//!
//! [sources]
//! proxy = "http://127.0.0.1:7890"
//! ```
//!
//! `DUMPMIND_WORKSPACE_ROOT` and `DUMPMIND_TEMPLATE_IMAGE` override the file.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::toolchain::PackageSet;

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Parent of every per-task workspace.
    pub workspace_root: PathBuf,

    /// Prepared userspace image, copied once per task.
    pub template_image: PathBuf,

    pub build_timeout_secs: u64,

    /// When set, make runs inside `nix-shell <shell_nix> --pure`.
    pub shell_nix: Option<PathBuf>,

    /// Home directory inside the image that receives the reproducer.
    pub trigger_home: PathBuf,

    /// Number of concurrent workers for `WorkerGroup`.
    pub workers: usize,

    pub toolchains: PackageSet,

    /// `.config` overrides applied before every build.
    pub kconfig: BTreeMap<String, String>,

    pub reproducer: Option<ReproducerSettings>,

    /// Where kernel sources and syzbot attachments are fetched from.
    pub sources: SourceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            template_image: PathBuf::from("image/debian.img"),
            build_timeout_secs: 3 * 60 * 60,
            shell_nix: None,
            trigger_home: PathBuf::from("root"),
            workers: 1,
            toolchains: PackageSet::default(),
            kconfig: BTreeMap::new(),
            reproducer: None,
            sources: SourceSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducerSettings {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_reproducer_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// `<kernel_archive_base><commit>.tar.gz` is the source tarball.
    pub kernel_archive_base: String,

    /// Base for the relative attachment links in a crash report.
    pub syzbot_base: String,

    /// Compiler command for the C reproducer; `-o <out> <src>` is appended.
    pub reproducer_cc: Vec<String>,

    /// HTTP(S) proxy for every download.
    pub proxy: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kernel_archive_base: "https://github.com/torvalds/linux/archive/".to_string(),
            syzbot_base: "https://syzkaller.appspot.com/".to_string(),
            reproducer_cc: vec!["gcc".into(), "-pthread".into(), "-static".into()],
            proxy: None,
        }
    }
}

fn default_reproducer_timeout() -> u64 {
    30 * 60
}

impl ReproducerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("DUMPMIND_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = var("DUMPMIND_TEMPLATE_IMAGE") {
            self.template_image = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "build_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sources.reproducer_cc.is_empty() {
            return Err(ConfigError::Invalid {
                field: "sources.reproducer_cc",
                reason: "must name a compiler".to_string(),
            });
        }
        if self.trigger_home.is_absolute()
            || self
                .trigger_home
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ConfigError::Invalid {
                field: "trigger_home",
                reason: "must be a path below the image root".to_string(),
            });
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}
