//! Toolchain resolution: compiler identifier -> build environment.
//!
//! Identifiers look like `gcc-12`, `clang-15` or `gcc-default`. Resolution is
//! a pure lookup against an explicit [`PackageSet`] and CPU count, so the same
//! identifier always yields the same descriptor on the same host config.
//!
//! Binaries are unversioned on purpose: the version is pinned by the package
//! (the nix attribute handed to `shell.nix`), not by the binary name.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::ReproError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerFamily {
    Gcc,
    Clang,
}

impl fmt::Display for CompilerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerFamily::Gcc => f.write_str("gcc"),
            CompilerFamily::Clang => f.write_str("clang"),
        }
    }
}

/// Parsed compiler identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompilerId {
    pub family: CompilerFamily,
    /// `None` only for `gcc-default`.
    pub major: Option<u32>,
}

impl fmt::Display for CompilerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.major {
            Some(major) => write!(f, "{}-{}", self.family, major),
            None => write!(f, "{}-default", self.family),
        }
    }
}

impl FromStr for CompilerId {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || ReproError::UnsupportedToolchain(s.to_string());
        let (family, rest) = s.split_once('-').ok_or_else(unsupported)?;
        let family = match family {
            "gcc" => CompilerFamily::Gcc,
            "clang" => CompilerFamily::Clang,
            _ => return Err(unsupported()),
        };
        let major = match (family, rest) {
            (CompilerFamily::Gcc, "default") => None,
            _ if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) => {
                Some(rest.parse().map_err(|_| unsupported())?)
            }
            _ => return Err(unsupported()),
        };
        Ok(Self { family, major })
    }
}

/// `gcc (Debian 12.2.0-14) 12.2.0`, `clang (Debian) 15.0.6`
static DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>gcc|clang) \(.*?\) (?P<major>\d+)(?:[.-][\d.-]*)?(?:\s|$)")
        .expect("compiler description pattern is valid")
});

impl CompilerId {
    /// Derive an identifier from a syzbot-style compiler description such as
    /// `gcc (GCC) 10.2.1 20210110` or `clang (Debian) 15.0.6`.
    pub fn from_description(description: &str) -> Result<Self, ReproError> {
        let unsupported = || ReproError::UnsupportedToolchain(description.to_string());
        let caps = DESCRIPTION
            .captures(description.trim())
            .ok_or_else(unsupported)?;
        let family = match &caps["name"] {
            "gcc" => CompilerFamily::Gcc,
            _ => CompilerFamily::Clang,
        };
        let major = caps["major"].parse().map_err(|_| unsupported())?;
        Ok(Self {
            family,
            major: Some(major),
        })
    }
}

/// Compiler versions the build environment can provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSet {
    pub gcc: BTreeSet<u32>,
    pub clang: BTreeSet<u32>,
}

impl Default for PackageSet {
    fn default() -> Self {
        Self {
            gcc: (8..=14).collect(),
            clang: (11..=19).collect(),
        }
    }
}

impl PackageSet {
    fn provides(&self, id: CompilerId) -> bool {
        match (id.family, id.major) {
            (CompilerFamily::Gcc, None) => true,
            (CompilerFamily::Gcc, Some(v)) => self.gcc.contains(&v),
            (CompilerFamily::Clang, Some(v)) => self.clang.contains(&v),
            (CompilerFamily::Clang, None) => false,
        }
    }
}

/// Resolved build environment for one compiler identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolchainDescriptor {
    /// Canonical identifier, also passed to `shell.nix` as `compiler`.
    pub id: String,
    pub family: CompilerFamily,
    /// Package providing the compiler (nix attribute name).
    pub package: String,
    /// CC, CXX, LD, AR, NM, OBJCOPY, STRIP.
    pub binaries: BTreeMap<String, String>,
    /// Extra `make` arguments, always including `-j<N>`.
    pub build_flags: Vec<String>,
    pub parallelism: usize,
}

impl ToolchainDescriptor {
    /// `KEY=value` assignments for the make command line.
    pub fn make_vars(&self) -> Vec<String> {
        self.binaries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    /// Arguments appended to every kernel `make` call.
    pub fn make_args(&self) -> Vec<String> {
        let mut args = self.make_vars();
        args.extend(self.build_flags.iter().cloned());
        args
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainResolver {
    packages: PackageSet,
    cpus: usize,
}

impl ToolchainResolver {
    pub fn new(packages: PackageSet, cpus: usize) -> Self {
        Self { packages, cpus }
    }

    /// Use the host CPU count.
    pub fn detect(packages: PackageSet) -> Self {
        let cpus = match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(e) => {
                warn!(error = %e, "could not detect CPU count, assuming 4");
                4
            }
        };
        Self::new(packages, cpus)
    }

    /// `-j` value: leave two cores for the host, never below one.
    pub fn parallelism(&self) -> usize {
        self.cpus.saturating_sub(2).max(1)
    }

    pub fn resolve(&self, identifier: &str) -> Result<ToolchainDescriptor, ReproError> {
        let id: CompilerId = identifier.trim().parse()?;
        if !self.packages.provides(id) {
            return Err(ReproError::UnsupportedToolchain(identifier.to_string()));
        }

        let parallelism = self.parallelism();
        let mut build_flags = vec![format!("-j{parallelism}")];

        let (package, tools): (String, [(&str, &str); 7]) = match id.family {
            CompilerFamily::Gcc => (
                id.major.map_or_else(|| "gcc".to_string(), |v| format!("gcc{v}")),
                [
                    ("CC", "gcc"),
                    ("CXX", "g++"),
                    ("LD", "ld"),
                    ("AR", "ar"),
                    ("NM", "nm"),
                    ("OBJCOPY", "objcopy"),
                    ("STRIP", "strip"),
                ],
            ),
            CompilerFamily::Clang => {
                build_flags.push("LLVM=1".to_string());
                (
                    format!("llvmPackages_{}", id.major.unwrap_or_default()),
                    [
                        ("CC", "clang"),
                        ("CXX", "clang++"),
                        ("LD", "ld.lld"),
                        ("AR", "llvm-ar"),
                        ("NM", "llvm-nm"),
                        ("OBJCOPY", "llvm-objcopy"),
                        ("STRIP", "llvm-strip"),
                    ],
                )
            }
        };

        Ok(ToolchainDescriptor {
            id: id.to_string(),
            family: id.family,
            package,
            binaries: tools
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            build_flags,
            parallelism,
        })
    }
}
