//! CLI Configuration

use anyhow::Context;
use std::path::{Path, PathBuf};
use tenancy_security::SecurityConfig;

/// Config file location: explicit path, else `<config dir>/opentenancy/tenancy[.<profile>].toml`
pub fn resolve_path(explicit: Option<&Path>, profile: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let filename = match profile {
        Some(p) => format!("tenancy.{p}.toml"),
        None => "tenancy.toml".to_string(),
    };
    base.join("opentenancy").join(filename)
}

/// Load the config file
pub fn load(path: &Path) -> anyhow::Result<SecurityConfig> {
    if !path.exists() {
        anyhow::bail!(
            "no config at {}; run `tenancyctl config init` first",
            path.display()
        );
    }
    SecurityConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Defaults rooted next to the config file
pub fn defaults_beside(path: &Path) -> SecurityConfig {
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut config = SecurityConfig {
        database_path: root.join("tenancy.db"),
        key_path: Some(root.join("master.key")),
        ..SecurityConfig::default()
    };
    config.backup.backup_dir = root.join("backups");
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_path(Some(Path::new("/etc/t.toml")), Some("prod"));
        assert_eq!(path, PathBuf::from("/etc/t.toml"));
    }

    #[test]
    fn test_profile_file_name() {
        let path = resolve_path(None, Some("staging"));
        assert!(path.ends_with("opentenancy/tenancy.staging.toml"));
    }

    #[test]
    fn test_defaults_beside() {
        let config = defaults_beside(Path::new("/srv/tenancy/tenancy.toml"));
        assert_eq!(config.database_path, PathBuf::from("/srv/tenancy/tenancy.db"));
        assert_eq!(config.backup.backup_dir, PathBuf::from("/srv/tenancy/backups"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_points_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("tenancy.toml")).unwrap_err();
        assert!(err.to_string().contains("config init"));
    }

    #[test]
    fn test_saved_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenancy.toml");
        let config = defaults_beside(&path);
        config.save(&path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.database_path, config.database_path);
        assert_eq!(loaded.key_path, config.key_path);
        assert_eq!(loaded.audit.buffer_capacity, config.audit.buffer_capacity);
    }
}
