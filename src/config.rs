use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Full service configuration: environment variables for the service
/// surface, plus an optional `foghorn.toml` carrying the health-check
/// inventory. Invalid configuration fails startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_path: String,
    pub redis_url: Option<String>,
    pub logs_service_url: Option<String>,
    pub session_service_url: Option<String>,
    pub orchestrator_url: Option<String>,
    pub retention: RetentionSettings,
    pub smtp: SmtpSettings,
    pub health: HealthInventory,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub days: u32,
    pub archive: ArchiveSettings,
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub enabled: bool,
    pub compression: bool,
    pub storage: StorageKind,
    pub local_path: String,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
}

impl StorageKind {
    pub fn parse(s: &str) -> Option<StorageKind> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Some(StorageKind::Local),
            "s3" => Some(StorageKind::S3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

// ── Health inventory (foghorn.toml) ──

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HealthInventory {
    #[serde(default)]
    pub services: Vec<ServiceTarget>,
    #[serde(default)]
    pub docker: Option<DockerTarget>,
    #[serde(default)]
    pub gateway: Option<GatewayTarget>,
    #[serde(default)]
    pub metrics_endpoints: Vec<String>,
    /// service → the services it depends on.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceTarget {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DockerTarget {
    pub project: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayTarget {
    pub url: String,
    /// route path → expected backend.
    pub routes: HashMap<String, String>,
}

impl HealthInventory {
    /// Load from a TOML file. A missing file means an empty inventory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(
                "health inventory not found at {}, starting with none",
                path.display()
            );
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let inventory: HealthInventory = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        tracing::info!(
            "loaded health inventory from {} ({} services)",
            path.display(),
            inventory.services.len()
        );
        Ok(inventory)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String> {
    env_opt(key).ok_or_else(|| Error::Config(format!("{key} must be set")))
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_opt(key).as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env_required("PORT")?
            .parse()
            .map_err(|_| Error::Config("PORT must be a number".into()))?;
        let database_path = env_required("DATABASE_URL")?;

        let days: u32 = match env_opt("LOG_RETENTION_DAYS") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Config("LOG_RETENTION_DAYS must be a number".into()))?,
            None => 30,
        };

        let storage = match env_opt("LOG_ARCHIVE_STORAGE_TYPE") {
            Some(v) => StorageKind::parse(&v).ok_or_else(|| {
                Error::Config(format!("LOG_ARCHIVE_STORAGE_TYPE {v:?} is not local|s3"))
            })?,
            None => StorageKind::Local,
        };

        let retention = RetentionSettings {
            days,
            archive: ArchiveSettings {
                enabled: env_bool("LOG_ARCHIVE_ENABLED"),
                compression: env_bool("LOG_ARCHIVE_COMPRESSION"),
                storage,
                local_path: env_opt("LOG_ARCHIVE_LOCAL_PATH")
                    .unwrap_or_else(|| "./archives".to_string()),
                s3_bucket: env_opt("LOG_ARCHIVE_S3_BUCKET"),
                s3_region: env_opt("LOG_ARCHIVE_S3_REGION"),
            },
        };
        retention.validate()?;

        let smtp = SmtpSettings {
            host: env_opt("SMTP_HOST"),
            port: env_opt("SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            user: env_opt("SMTP_USER"),
            pass: env_opt("SMTP_PASS"),
            from: env_opt("SMTP_FROM").unwrap_or_else(|| "foghorn@localhost".to_string()),
        };

        let inventory_path =
            env_opt("FOGHORN_CONFIG").unwrap_or_else(|| "./foghorn.toml".to_string());
        let health = HealthInventory::load(inventory_path)?;

        Ok(AppConfig {
            port,
            database_path,
            redis_url: env_opt("REDIS_URL"),
            logs_service_url: env_opt("LOGS_SERVICE_URL"),
            session_service_url: env_opt("SESSION_SERVICE_URL"),
            orchestrator_url: env_opt("ORCHESTRATOR_URL"),
            retention,
            smtp,
            health,
        })
    }
}

impl RetentionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.days == 0 {
            return Err(Error::Config("LOG_RETENTION_DAYS must be > 0".into()));
        }
        if self.archive.enabled
            && self.archive.storage == StorageKind::S3
            && self.archive.s3_bucket.is_none()
        {
            return Err(Error::Config(
                "LOG_ARCHIVE_S3_BUCKET must be set for s3 storage".into(),
            ));
        }
        if self.archive.enabled
            && self.archive.storage == StorageKind::Local
            && self.archive.local_path.is_empty()
        {
            return Err(Error::Config("LOG_ARCHIVE_LOCAL_PATH must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(enabled: bool, storage: StorageKind) -> ArchiveSettings {
        ArchiveSettings {
            enabled,
            compression: false,
            storage,
            local_path: "./archives".into(),
            s3_bucket: None,
            s3_region: None,
        }
    }

    #[test]
    fn test_zero_retention_days_invalid() {
        let settings = RetentionSettings {
            days: 0,
            archive: archive(false, StorageKind::Local),
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_s3_without_bucket_invalid_only_when_enabled() {
        let mut settings = RetentionSettings {
            days: 30,
            archive: archive(true, StorageKind::S3),
        };
        assert!(settings.validate().is_err());

        settings.archive.s3_bucket = Some("logs".into());
        assert!(settings.validate().is_ok());

        settings.archive.s3_bucket = None;
        settings.archive.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!(StorageKind::parse("local"), Some(StorageKind::Local));
        assert_eq!(StorageKind::parse("S3"), Some(StorageKind::S3));
        assert_eq!(StorageKind::parse("gcs"), None);
    }

    #[test]
    fn test_inventory_parse() {
        let inventory: HealthInventory = toml::from_str(
            r#"
            metrics_endpoints = ["http://portal:8080/metrics"]

            [[services]]
            name = "portal"
            url = "http://portal:8080/health"

            [[services]]
            name = "review"
            url = "http://review:8081/health"

            [docker]
            project = "platform"
            services = ["portal", "review"]

            [gateway]
            url = "http://gateway:9000"
            [gateway.routes]
            "/portal" = "http://portal:8080"

            [dependencies]
            review = ["portal"]
            "#,
        )
        .unwrap();
        assert_eq!(inventory.service_names(), vec!["portal", "review"]);
        assert_eq!(inventory.docker.as_ref().unwrap().services.len(), 2);
        assert_eq!(inventory.dependencies["review"], vec!["portal"]);
    }

    #[test]
    fn test_missing_inventory_file_is_empty() {
        let inventory = HealthInventory::load("/nonexistent/foghorn.toml").unwrap();
        assert!(inventory.services.is_empty());
    }
}
