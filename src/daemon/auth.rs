//! Credentials in a stack's CLI home, and recognising auth failures in the
//! daemon log.

use crate::Result;
use crate::error::DaemonError;
use crate::step::StepResult;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time;

pub const CREDENTIALS_FILE: &str = "access.key";
const SETTINGS_FILE: &str = "settings.json";

pub fn credentials_path(cli_home: &Path) -> PathBuf {
    cli_home.join(CREDENTIALS_FILE)
}

pub fn has_credentials(cli_home: &Path) -> bool {
    std::fs::metadata(credentials_path(cli_home)).is_ok_and(|m| m.is_file() && m.len() > 0)
}

fn copy_credentials(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    std::fs::copy(credentials_path(from), credentials_path(to))?;
    let settings = from.join(SETTINGS_FILE);
    if settings.is_file() && !to.join(SETTINGS_FILE).exists() {
        std::fs::copy(settings, to.join(SETTINGS_FILE))?;
    }
    Ok(())
}

/// Copies credentials from the first legacy home that has them, once. Never
/// overwrites existing credentials.
pub fn migrate_legacy_credentials(cli_home: &Path, legacy_homes: &[PathBuf]) -> StepResult {
    if has_credentials(cli_home) {
        return StepResult::skipped("credentials already present");
    }
    let Some(source) = legacy_homes
        .iter()
        .find(|h| h.as_path() != cli_home && has_credentials(h))
    else {
        return StepResult::skipped("no legacy credentials");
    };
    StepResult::attempt(
        &format!("migrated credentials from {}", source.display()),
        || copy_credentials(source, cli_home),
    )
}

/// Replaces the credentials in `to` with those from `from`.
pub fn reseed_credentials(from: &Path, to: &Path) -> StepResult {
    if !has_credentials(from) {
        return StepResult::failed(format!("no credentials in {}", from.display()));
    }
    if from == to {
        return StepResult::failed("refusing to reseed a stack from itself");
    }
    StepResult::attempt(&format!("reseeded credentials from {}", from.display()), || {
        copy_credentials(from, to)
    })
}

/// Known first-run failures in the daemon log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LogSignature {
    MissingCredentials,
    CredentialsRejected,
    Unknown,
}

static MISSING_CREDENTIALS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(no credentials|credentials not found|not authenticated|auth login|access\.key.*(not found|missing|ENOENT))")
        .unwrap()
});

static CREDENTIALS_REJECTED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\b401\b|unauthorized|invalid token|token (expired|rejected))")
        .unwrap()
});

/// Classifies the tail of a daemon log. Missing credentials takes priority:
/// a daemon without credentials may also log the server's 401.
pub fn classify_daemon_log(text: &str) -> LogSignature {
    if MISSING_CREDENTIALS_RE.is_match(text) {
        LogSignature::MissingCredentials
    } else if CREDENTIALS_REJECTED_RE.is_match(text) {
        LogSignature::CredentialsRejected
    } else {
        LogSignature::Unknown
    }
}

/// Polls for the credentials file until it appears, `timeout` passes, or
/// `shutting_down` is set.
pub async fn wait_for_credentials(
    cli_home: &Path,
    timeout: Duration,
    interval: Duration,
    shutting_down: &AtomicBool,
) -> Result<()> {
    let deadline = time::Instant::now() + timeout;
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;
        if has_credentials(cli_home) {
            info!("credentials found in {}", cli_home.display());
            return Ok(());
        }
        if shutting_down.load(Ordering::Relaxed) {
            miette::bail!("shutting down while waiting for credentials");
        }
        if time::Instant::now() >= deadline {
            return Err(DaemonError::AuthTimeout {
                seconds: timeout.as_secs(),
                path: credentials_path(cli_home),
                help: "log in from another terminal, then start the daemon again".to_string(),
            }
            .into());
        }
    }
}

/// Command a user runs to create credentials for this CLI home.
pub fn login_command(cli_bin: &Path, cli_home: &Path, server_url: &str) -> String {
    format!(
        "HAPPY_HOME_DIR={} HAPPY_SERVER_URL={server_url} {} auth login",
        shell_words::quote(&cli_home.to_string_lossy()),
        shell_words::quote(&cli_bin.to_string_lossy()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_daemon_log() {
        assert_eq!(
            classify_daemon_log("[daemon] No credentials found, run `happy auth login`"),
            LogSignature::MissingCredentials
        );
        assert_eq!(
            classify_daemon_log("Request failed with status code 401"),
            LogSignature::CredentialsRejected
        );
        assert_eq!(
            classify_daemon_log("Error: Unauthorized"),
            LogSignature::CredentialsRejected
        );
        assert_eq!(
            classify_daemon_log("listening on port 4010"),
            LogSignature::Unknown
        );
        // port numbers containing 401 are not rejections
        assert_eq!(classify_daemon_log("connect to :34010"), LogSignature::Unknown);
    }

    #[test]
    fn test_migrate_only_when_missing() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("legacy");
        let home = dir.path().join("stack/cli");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(credentials_path(&legacy), "secret").unwrap();
        std::fs::write(legacy.join(SETTINGS_FILE), "{}").unwrap();

        let step = migrate_legacy_credentials(&home, &[dir.path().join("nope"), legacy.clone()]);
        assert!(step.ok, "{}", step.detail);
        assert_eq!(std::fs::read_to_string(credentials_path(&home)).unwrap(), "secret");
        assert!(home.join(SETTINGS_FILE).is_file());

        std::fs::write(credentials_path(&legacy), "newer").unwrap();
        let step = migrate_legacy_credentials(&home, &[legacy]);
        assert!(step.detail.starts_with("skipped"));
        assert_eq!(std::fs::read_to_string(credentials_path(&home)).unwrap(), "secret");
    }

    #[test]
    fn test_reseed() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main/cli");
        let exp = dir.path().join("exp1/cli");
        assert!(!reseed_credentials(&main, &exp).ok);

        std::fs::create_dir_all(&main).unwrap();
        std::fs::write(credentials_path(&main), "good").unwrap();
        std::fs::create_dir_all(&exp).unwrap();
        std::fs::write(credentials_path(&exp), "rejected").unwrap();
        assert!(reseed_credentials(&main, &exp).ok);
        assert_eq!(std::fs::read_to_string(credentials_path(&exp)).unwrap(), "good");
        assert!(!reseed_credentials(&main, &main).ok);
    }

    #[tokio::test]
    async fn test_wait_for_credentials() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().to_path_buf();
        let stop = AtomicBool::new(false);

        let err = wait_for_credentials(&home, Duration::from_millis(30), Duration::from_millis(10), &stop)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let writer = {
            let home = home.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(20)).await;
                std::fs::write(credentials_path(&home), "k").unwrap();
            })
        };
        wait_for_credentials(&home, Duration::from_secs(5), Duration::from_millis(5), &stop)
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[test]
    fn test_login_command() {
        let cmd = login_command(
            Path::new("/src/cli/bin/happy.mjs"),
            Path::new("/s/exp 1/cli"),
            "http://127.0.0.1:4010",
        );
        assert_eq!(
            cmd,
            "HAPPY_HOME_DIR='/s/exp 1/cli' HAPPY_SERVER_URL=http://127.0.0.1:4010 /src/cli/bin/happy.mjs auth login"
        );
    }
}
