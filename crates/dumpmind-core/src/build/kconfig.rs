//! Kernel `.config` overrides.
//!
//! An override value of `n` is written the way Kconfig writes a disabled
//! symbol (`# CONFIG_X is not set`). Symbols absent from the file are
//! appended. The result still needs `make olddefconfig`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

/// Current value of `key` in one `.config` line, if the line is about `key`.
fn value_of<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("# ") {
        return (rest.strip_suffix(" is not set")? == key).then_some("n");
    }
    let (k, v) = line.split_once('=')?;
    (k.trim() == key).then(|| v.trim())
}

fn render(key: &str, value: &str) -> String {
    if value == "n" {
        format!("# {key} is not set")
    } else {
        format!("{key}={value}")
    }
}

/// Merge `overrides` into `config`.
///
/// Returns the new text and the keys whose value changed or were added.
pub fn merge(config: &str, overrides: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let mut changed = Vec::new();
    let mut seen = BTreeSet::new();

    let mut lines: Vec<String> = config
        .lines()
        .map(|line| {
            for (key, expected) in overrides {
                if let Some(actual) = value_of(line, key) {
                    seen.insert(key.as_str());
                    if actual != expected {
                        debug!(%key, %expected, %actual, "kconfig override");
                        changed.push(key.clone());
                        return render(key, expected);
                    }
                }
            }
            line.to_string()
        })
        .collect();

    for (key, expected) in overrides {
        if !seen.contains(key.as_str()) {
            debug!(%key, %expected, "kconfig symbol added");
            changed.push(key.clone());
            lines.push(render(key, expected));
        }
    }

    let mut text = lines.join("\n");
    text.push('\n');
    (text, changed)
}

/// Apply `overrides` to the `.config` at `path`. Returns whether the file
/// was rewritten.
pub fn apply_overrides(path: &Path, overrides: &BTreeMap<String, String>) -> io::Result<bool> {
    if overrides.is_empty() {
        return Ok(false);
    }
    let current = fs::read_to_string(path)?;
    let (updated, changed) = merge(&current, overrides);
    if changed.is_empty() {
        return Ok(false);
    }
    info!(config = %path.display(), changed = ?changed, "updating kernel config");
    fs::write(path, updated)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_disables_and_appends() {
        let config = "CONFIG_FOO=y\n# CONFIG_KEXEC is not set\nCONFIG_BTF=y\nCONFIG_FOOBAR=m\n";
        let (text, changed) = merge(
            config,
            &overrides(&[
                ("CONFIG_KEXEC", "y"),
                ("CONFIG_BTF", "n"),
                ("CONFIG_NEW", "m"),
                ("CONFIG_FOO", "y"),
            ]),
        );

        assert_eq!(
            text,
            "CONFIG_FOO=y\nCONFIG_KEXEC=y\n# CONFIG_BTF is not set\nCONFIG_FOOBAR=m\nCONFIG_NEW=m\n"
        );
        assert_eq!(changed, vec!["CONFIG_KEXEC", "CONFIG_BTF", "CONFIG_NEW"]);
    }

    #[test]
    fn prefix_symbols_are_not_confused() {
        // CONFIG_FOO の override が CONFIG_FOOBAR を書き換えてはいけない
        let (text, _) = merge("CONFIG_FOOBAR=y\n", &overrides(&[("CONFIG_FOO", "n")]));
        assert_eq!(text, "CONFIG_FOOBAR=y\n# CONFIG_FOO is not set\n");
    }

    #[test]
    fn up_to_date_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".config");
        fs::write(&path, "CONFIG_KEXEC=y\n").unwrap();

        assert!(!apply_overrides(&path, &overrides(&[("CONFIG_KEXEC", "y")])).unwrap());
        assert!(apply_overrides(&path, &overrides(&[("CONFIG_KEXEC", "n")])).unwrap());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# CONFIG_KEXEC is not set\n"
        );
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_overrides(&dir.path().join(".config"), &overrides(&[("CONFIG_X", "y")]));
        assert!(err.is_err());
    }
}
