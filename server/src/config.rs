use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "fitlog").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("fitlog.db");

        Ok(Config { db_path, data_dir })
    }

    /// Load the JWT signing secret from disk, or generate a new one.
    ///
    /// The secret lives in the data directory with 0600 permissions;
    /// regenerating it invalidates every outstanding token.
    pub fn load_or_create_jwt_secret(&self) -> Result<String> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("jwt_secret");

        if path.exists() {
            let secret =
                std::fs::read_to_string(&path).context("Failed to read JWT secret file")?;
            let secret = secret.trim().to_string();
            if !secret.is_empty() {
                return Ok(secret);
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let secret = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &secret).context("Failed to write JWT secret file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set JWT secret file permissions")?;
        }
        Ok(secret)
    }
}

/// Sentinel app id shipped in sample env files; treated the same as no
/// credentials at all.
const PLACEHOLDER_APP_ID: &str = "your_app_id_here";

#[derive(Debug, Clone)]
pub struct NutritionixCredentials {
    pub app_id: String,
    pub api_key: String,
}

impl NutritionixCredentials {
    /// Read provider credentials from `NUTRITIONIX_APP_ID` /
    /// `NUTRITIONIX_API_KEY`. Returns `None` when either is unset,
    /// empty, or the placeholder; the server then serves deterministic
    /// mock nutrition data instead.
    pub fn from_env() -> Option<Self> {
        let app_id = std::env::var("NUTRITIONIX_APP_ID").ok()?;
        let api_key = std::env::var("NUTRITIONIX_API_KEY").ok()?;
        if app_id.trim().is_empty() || api_key.trim().is_empty() || app_id == PLACEHOLDER_APP_ID {
            return None;
        }
        Some(Self { app_id, api_key })
    }
}
