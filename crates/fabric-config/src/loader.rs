// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::RuntimeConfig;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/fabric/config.yaml"));
    paths.push(PathBuf::from("/etc/fabric/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/fabric/config.yaml"));
        paths.push(home.join(".config/fabric/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("fabric/config.yaml"));
        paths.push(cfg.join("fabric/config.yml"));
    }

    paths.push(PathBuf::from(".fabric/config.yaml"));
    paths.push(PathBuf::from(".fabric/config.yml"));
    paths.push(PathBuf::from("fabric.yaml"));
    paths.push(PathBuf::from("fabric.yml"));

    paths
}

/// Loads `RuntimeConfig` by merging all discovered YAML files.
/// `extra` may provide an explicit path (e.g. a `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading fabric config layer");
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit fabric config");
        let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: RuntimeConfig = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        RuntimeConfig::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("journal_capacity: 100");
        let src = val("journal_capacity: 200");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["journal_capacity"].as_u64(), Some(200));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("journal_capacity: 100\ndebounce_ms: 3000");
        let src = val("debounce_ms: 5000");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["journal_capacity"].as_u64(), Some(100));
        assert_eq!(dst["debounce_ms"].as_u64(), Some(5000));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/fabric_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.journal_capacity, RuntimeConfig::default().journal_capacity);
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "journal_capacity: 512\ndebounce_ms: 1000").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.journal_capacity, 512);
        assert_eq!(cfg.debounce_ms, 1000);
    }
}
