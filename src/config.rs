use crate::types::Role;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub input: InputConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// SE polygon GeoJSON, either an http(s) URL or a local path.
    pub se_geojson: String,
    /// Optional default point CSV, same URL-or-path convention.
    pub points_csv: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub regions: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"
            [server]
            port = 8080

            [input]
            se_geojson = "data/emop2026.geojson"

            [[auth.users]]
            username = "admin"
            password = "admin2026"
            role = "admin"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.static_dir, PathBuf::from("static"));
        assert!(config.input.points_csv.is_none());
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].role, Role::Admin);
        assert!(config.auth.users[0].regions.is_empty());
    }
}
