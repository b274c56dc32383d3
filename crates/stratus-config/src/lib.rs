//! Stratus project configuration
//!
//! Locates and loads `stratus.yaml`, which names the project, selects the
//! state backend and tunes lock retries and the provisioner.

pub mod error;
pub mod model;

pub use error::*;
pub use model::*;

use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "STRATUS_CONFIG_PATH";
const CONFIG_CANDIDATES: [&str; 2] = ["stratus.local.yaml", "stratus.yaml"];
const PROJECT_DIR: &str = ".stratus";

/// Global Stratus configuration directory (`~/.config/stratus`)
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("stratus");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Find the project's configuration file
///
/// Search order:
/// 1. `STRATUS_CONFIG_PATH` (direct path)
/// 2. current directory: `stratus.local.yaml`, `stratus.yaml`
/// 3. `./.stratus/` with the same names
/// 4. `~/.config/stratus/stratus.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    if let Some(path) = first_existing(&current_dir) {
        return Ok(path);
    }

    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        if let Some(path) = first_existing(&project_dir) {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("stratus").join("stratus.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Load and validate a configuration file, resolving relative paths against its directory
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)?;
    let mut config: ProjectConfig =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    config.validate().map_err(|message| ConfigError::Invalid {
        path: path.to_path_buf(),
        message,
    })?;

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_paths(&base_dir);

    Ok(config)
}

/// Discover and load the project configuration
pub fn load_project_config() -> Result<ProjectConfig> {
    let path = find_config_file()?;
    load_config(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("stratus"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("stratus.yaml"), "project: demo\n").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let result = temp_env::with_var_unset(CONFIG_ENV_VAR, find_config_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with("stratus.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("stratus.yaml"), "project: shared\n").unwrap();
        fs::write(temp_dir.path().join("stratus.local.yaml"), "project: mine\n").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let result = temp_env::with_var_unset(CONFIG_ENV_VAR, find_config_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with("stratus.local.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let project_dir = temp_dir.path().join(".stratus");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("stratus.yaml"), "project: demo\n").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let result = temp_env::with_var_unset(CONFIG_ENV_VAR, find_config_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with(".stratus/stratus.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "project: demo\n").unwrap();

        let result = temp_env::with_var(CONFIG_ENV_VAR, Some(&config_path), find_config_file);

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    #[serial]
    fn test_load_config_resolves_relative_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("stratus.yaml");
        fs::write(
            &config_path,
            "project: demo\nbackend:\n  type: local\n  path: state\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::Local {
                path: temp_dir.path().join("state")
            }
        );
    }

    #[test]
    fn test_load_config_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("stratus.yaml");
        fs::write(&config_path, "project: demo\nlock:\n  max_attempts: 0\n").unwrap();

        match load_config(&config_path) {
            Err(ConfigError::Invalid { message, .. }) => {
                assert!(message.contains("max_attempts"));
            }
            other => panic!("Expected Invalid error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_config_bad_yaml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("stratus.yaml");
        fs::write(&config_path, "project: [unterminated\n").unwrap();

        assert!(matches!(
            load_config(&config_path),
            Err(ConfigError::Yaml { .. })
        ));
    }
}
