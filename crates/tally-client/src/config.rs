use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use tally_types::models::{GroupId, UserId};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub user_id: Option<UserId>,
    pub db_path: PathBuf,
    pub fallback_dir: PathBuf,
    pub watch_interval: Duration,
    /// Group to keep loaded and flushed, if any.
    pub group_id: Option<GroupId>,
    pub http_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let user_id = get("TALLY_USER_ID")
            .map(|v| v.parse().context("TALLY_USER_ID must be an integer"))
            .transpose()?;
        let group_id = get("TALLY_GROUP_ID")
            .map(|v| v.parse().context("TALLY_GROUP_ID must be an integer"))
            .transpose()?;
        let watch_secs: u64 = get("TALLY_WATCH_INTERVAL_SECS")
            .unwrap_or_else(|| "20".into())
            .parse()
            .context("TALLY_WATCH_INTERVAL_SECS must be a number of seconds")?;
        let http_secs: u64 = get("TALLY_HTTP_TIMEOUT_SECS")
            .unwrap_or_else(|| "15".into())
            .parse()
            .context("TALLY_HTTP_TIMEOUT_SECS must be a number of seconds")?;

        Ok(Self {
            api_url: get("TALLY_API_URL").unwrap_or_else(|| "http://localhost:18080".into()),
            token: get("TALLY_TOKEN"),
            user_id,
            db_path: get("TALLY_DB_PATH").unwrap_or_else(|| "tally.db".into()).into(),
            fallback_dir: get("TALLY_FALLBACK_DIR").unwrap_or_else(|| "./tally-store".into()).into(),
            watch_interval: Duration::from_secs(watch_secs.max(1)),
            group_id,
            http_timeout: Duration::from_secs(http_secs.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ClientConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.api_url, "http://localhost:18080");
        assert!(cfg.token.is_none());
        assert_eq!(cfg.db_path, PathBuf::from("tally.db"));
        assert_eq!(cfg.fallback_dir, PathBuf::from("./tally-store"));
        assert_eq!(cfg.watch_interval, Duration::from_secs(20));
        assert_eq!(cfg.http_timeout, Duration::from_secs(15));
        assert!(cfg.group_id.is_none());
    }

    #[test]
    fn overrides_and_blank_values() {
        let cfg = config(&[
            ("TALLY_TOKEN", "  "),
            ("TALLY_USER_ID", "12"),
            ("TALLY_GROUP_ID", "7"),
            ("TALLY_WATCH_INTERVAL_SECS", "0"),
        ])
        .unwrap();
        assert!(cfg.token.is_none());
        assert_eq!(cfg.user_id, Some(12));
        assert_eq!(cfg.group_id, Some(7));
        assert_eq!(cfg.watch_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert!(config(&[("TALLY_GROUP_ID", "seven")]).is_err());
    }
}
