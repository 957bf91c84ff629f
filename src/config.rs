use std::time::Duration;

use anyhow::{ensure, Result};
use clap::{ArgAction, Args};

use crate::application::ServiceSettings;
use crate::lock::LockSettings;

/// Process settings. Every field can be given as a flag or an environment variable.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Ledger database file path
    #[arg(short, long, env = "DATABASE_PATH", default_value = "saldo.db")]
    pub database: String,

    /// Serialize same-user operations through Redis (true/1/yes)
    #[arg(long, env = "REDIS_ENABLED", default_value = "false", value_parser = parse_flag, action = ArgAction::Set)]
    pub redis_enabled: bool,

    /// Redis address as host:port
    #[arg(long, env = "REDIS_ADDR", default_value = "localhost:6379")]
    pub redis_addr: String,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Redis logical database
    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    pub redis_db: i64,

    /// Lifetime of a user lock, in milliseconds
    #[arg(long, env = "LOCK_TTL_MS", default_value_t = 5000)]
    pub lock_ttl_ms: u64,

    /// Pause between lock attempts while another holder is active, in milliseconds
    #[arg(long, env = "LOCK_RETRY_MS", default_value_t = 100)]
    pub lock_retry_ms: u64,

    /// Time budget for one deposit or withdrawal, in milliseconds.
    /// Also bounds how long a ledger write waits on a busy database.
    #[arg(long, env = "OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    pub operation_timeout_ms: u64,
}

impl Settings {
    /// Check that the timings can hold the lock for a whole critical section.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.lock_retry_ms > 0, "lock retry interval must be positive");
        ensure!(
            self.lock_retry_ms < self.lock_ttl_ms,
            "lock retry interval ({} ms) must be shorter than the lock TTL ({} ms)",
            self.lock_retry_ms,
            self.lock_ttl_ms
        );
        self.service_settings()?;
        Ok(())
    }

    /// SQLite URL for the configured database, created on first use.
    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            distributed: self.redis_enabled,
            redis_addr: self.redis_addr.clone(),
            redis_password: self.redis_password.clone(),
            redis_db: self.redis_db,
            retry_interval: Duration::from_millis(self.lock_retry_ms),
        }
    }

    pub fn service_settings(&self) -> Result<ServiceSettings> {
        ServiceSettings::new(
            Duration::from_millis(self.lock_ttl_ms),
            Duration::from_millis(self.operation_timeout_ms),
        )
    }
}

/// Boolean flag in the forms accepted by the deployment environment.
fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(format!("expected true/1/yes or false/0/no, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["saldo"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).settings
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("true"), Ok(true));
        assert_eq!(parse_flag("YES"), Ok(true));
        assert_eq!(parse_flag("1"), Ok(true));
        assert_eq!(parse_flag("no"), Ok(false));
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_flags_map_to_lock_and_service_settings() {
        let settings = parse(&[
            "--database",
            "/tmp/ledger.db",
            "--redis-enabled",
            "yes",
            "--redis-addr",
            "redis:6380",
            "--lock-ttl-ms",
            "3000",
            "--lock-retry-ms",
            "50",
            "--operation-timeout-ms",
            "1500",
        ]);
        settings.validate().unwrap();

        assert_eq!(settings.database_url(), "sqlite:/tmp/ledger.db?mode=rwc");

        let lock = settings.lock_settings();
        assert!(lock.distributed);
        assert_eq!(lock.redis_addr, "redis:6380");
        assert_eq!(lock.retry_interval, Duration::from_millis(50));

        let service = settings.service_settings().unwrap();
        assert_eq!(service.lock_ttl(), Duration::from_secs(3));
        assert_eq!(service.operation_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_defaults_are_valid() {
        parse(&[]).validate().unwrap();
    }

    #[test]
    fn test_timeout_not_covered_by_ttl_is_rejected() {
        let settings = parse(&["--lock-ttl-ms", "1000", "--operation-timeout-ms", "1500"]);
        assert!(settings.validate().is_err());

        let settings = parse(&["--lock-ttl-ms", "1000", "--operation-timeout-ms", "600"]);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_not_shorter_than_ttl_is_rejected() {
        let settings = parse(&[
            "--lock-ttl-ms",
            "100",
            "--lock-retry-ms",
            "100",
            "--operation-timeout-ms",
            "50",
        ]);
        assert!(settings.validate().is_err());
    }
}
