use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fetch::FetchOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "carddav-tsv";

const DEFAULT_FILE: &str = "~/contacts.tsv";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_BATCH_SIZE: usize = 25;

/// Everything a sync run needs, resolved from flags, file and defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Address book collection URL, or the server root when
    /// `address_book` is set
    pub url: String,
    pub user: String,
    pub password: String,
    pub auth_mode: AuthMode,
    pub verify_tls: bool,
    /// The local TSV file
    pub file_path: PathBuf,
    /// Address book to discover under `url`
    pub address_book: Option<String>,
    /// Limit for each network request
    pub timeout: Duration,
    pub concurrency: usize,
    pub batch_size: usize,
}

impl SyncConfig {
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            concurrency: self.concurrency,
            batch_size: self.batch_size,
        }
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// HTTP authentication scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Credentials sent with every request
    #[default]
    Basic,
    /// Challenge-response, answered after the first 401
    Digest,
}

impl AuthMode {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(AuthMode::Basic),
            "digest" => Some(AuthMode::Digest),
            _ => None,
        }
    }
}

// =============================================================================
// Command line overrides
// =============================================================================

/// Values given on the command line. They win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub digest: bool,
    pub no_cert_verify: bool,
    pub file: Option<PathBuf>,
    pub address_book: Option<String>,
    pub timeout_secs: Option<u64>,
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
}

// =============================================================================
// Config file deserialization
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    password_command: Option<String>,
    auth: Option<String>,
    verify_tls: Option<bool>,
    file: Option<PathBuf>,
    address_book: Option<String>,
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
    batch_size: Option<usize>,
}

const KNOWN_KEYS: [&str; 11] = [
    "url",
    "user",
    "password",
    "password_command",
    "auth",
    "verify_tls",
    "file",
    "address_book",
    "timeout_secs",
    "concurrency",
    "batch_size",
];

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Load the config file. An explicit path must exist; the default one is
/// optional.
fn load_file(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = match explicit {
        Some(path) => {
            let path = expand_tilde(path);
            if !path.exists() {
                bail!("configuration file not found at {}", path.display());
            }
            path
        }
        None => {
            let path = config_path()?;
            if !path.exists() {
                debug!("no configuration file at {}", path.display());
                return Ok(ConfigFile::default());
            }
            path
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    parse_file(&raw, &path)
}

fn parse_file(raw: &str, path: &Path) -> Result<ConfigFile> {
    let value: toml::Value = toml::from_str(raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    warn_unknown_keys(&value);

    value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))
}

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    let known: HashSet<&str> = KNOWN_KEYS.into_iter().collect();
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve the run configuration: command line over config file over
/// defaults. `prompt` is asked for the password only when no other source
/// provides one.
pub fn resolve<P>(overrides: Overrides, explicit: Option<&Path>, prompt: P) -> Result<SyncConfig>
where
    P: FnOnce(&str) -> Result<String>,
{
    let file = load_file(explicit)?;
    build(file, overrides, prompt)
}

fn build<P>(file: ConfigFile, overrides: Overrides, prompt: P) -> Result<SyncConfig>
where
    P: FnOnce(&str) -> Result<String>,
{
    let url = non_empty(overrides.url.or(file.url)).ok_or_else(|| {
        anyhow!("no server URL given; pass it as an argument or set `url` in the config file")
    })?;
    let user = non_empty(overrides.user.or(file.user)).ok_or_else(|| {
        anyhow!("no user name given; pass --user or set `user` in the config file")
    })?;

    let auth_mode = if overrides.digest {
        AuthMode::Digest
    } else {
        match file.auth.as_deref() {
            Some(value) => AuthMode::from_str(value).ok_or_else(|| {
                anyhow!("invalid auth `{value}`; expected \"basic\" or \"digest\"")
            })?,
            None => AuthMode::default(),
        }
    };
    let verify_tls = !overrides.no_cert_verify && file.verify_tls.unwrap_or(true);

    let file_path = expand_tilde(
        &overrides
            .file
            .or(file.file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE)),
    );
    let address_book = non_empty(overrides.address_book.or(file.address_book));

    let timeout_secs = at_least_one(
        "timeout_secs",
        overrides.timeout_secs.or(file.timeout_secs),
        DEFAULT_TIMEOUT_SECS,
    )?;
    let concurrency = at_least_one(
        "concurrency",
        overrides.concurrency.or(file.concurrency),
        DEFAULT_CONCURRENCY,
    )?;
    let batch_size = at_least_one(
        "batch_size",
        overrides.batch_size.or(file.batch_size),
        DEFAULT_BATCH_SIZE,
    )?;

    let password = match overrides.password.or(file.password) {
        Some(password) => password,
        None => match file.password_command {
            Some(command) => run_password_command(&command)?,
            None => prompt(&user)?,
        },
    };

    Ok(SyncConfig {
        url,
        user,
        password,
        auth_mode,
        verify_tls,
        file_path,
        address_book,
        timeout: Duration::from_secs(timeout_secs),
        concurrency,
        batch_size,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn at_least_one<T>(name: &str, value: Option<T>, default: T) -> Result<T>
where
    T: PartialOrd + From<u8> + Copy,
{
    let value = value.unwrap_or(default);
    if value < T::from(1) {
        bail!("`{name}` must be at least 1");
    }
    Ok(value)
}

/// Run `command` through the shell and take the first line of its output.
fn run_password_command(command: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to run password_command `{command}`"))?;

    if !output.status.success() {
        bail!(
            "password_command `{}` failed ({}): {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("password_command `{command}` printed invalid UTF-8"))?;
    let password = stdout.lines().next().unwrap_or_default().to_string();
    if password.is_empty() {
        bail!("password_command `{command}` printed nothing");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tempfile::TempDir;

    use super::*;

    fn file(raw: &str) -> ConfigFile {
        parse_file(raw, Path::new("config.toml")).unwrap()
    }

    fn no_prompt(_: &str) -> Result<String> {
        panic!("password prompt should not be used")
    }

    fn minimal() -> ConfigFile {
        file(
            r#"
url = "https://dav.example.com/abook/"
user = "alice"
password = "secret"
"#,
        )
    }

    #[test]
    fn test_defaults() {
        let config = build(minimal(), Overrides::default(), no_prompt).unwrap();

        assert_eq!(config.url, "https://dav.example.com/abook/");
        assert_eq!(config.user, "alice");
        assert_eq!(config.password, "secret");
        assert_eq!(config.auth_mode, AuthMode::Basic);
        assert!(config.verify_tls);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.fetch_options(), FetchOptions::default());
        assert!(config.file_path.ends_with("contacts.tsv"));
        assert!(config.address_book.is_none());
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let file = file(
            r#"
url = "https://file.example.com/"
user = "file-user"
password = "file-pass"
auth = "basic"
file = "/tmp/from-file.tsv"
concurrency = 8
"#,
        );
        let overrides = Overrides {
            url: Some("https://cli.example.com/".to_string()),
            user: Some("cli-user".to_string()),
            password: Some("cli-pass".to_string()),
            digest: true,
            no_cert_verify: true,
            file: Some(PathBuf::from("/tmp/from-cli.tsv")),
            concurrency: Some(2),
            ..Overrides::default()
        };

        let config = build(file, overrides, no_prompt).unwrap();

        assert_eq!(config.url, "https://cli.example.com/");
        assert_eq!(config.user, "cli-user");
        assert_eq!(config.password, "cli-pass");
        assert_eq!(config.auth_mode, AuthMode::Digest);
        assert!(!config.verify_tls);
        assert_eq!(config.file_path, PathBuf::from("/tmp/from-cli.tsv"));
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn test_file_values_apply() {
        let file = file(
            r#"
url = "https://dav.example.com/"
user = "alice"
password = "secret"
auth = "Digest"
verify_tls = false
address_book = "work"
timeout_secs = 5
batch_size = 50
"#,
        );

        let config = build(file, Overrides::default(), no_prompt).unwrap();

        assert_eq!(config.auth_mode, AuthMode::Digest);
        assert!(!config.verify_tls);
        assert_eq!(config.address_book.as_deref(), Some("work"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_missing_url_or_user() {
        let err = build(ConfigFile::default(), Overrides::default(), no_prompt).unwrap_err();
        assert!(err.to_string().contains("URL"));

        let overrides = Overrides {
            url: Some("https://dav.example.com/".to_string()),
            user: Some("   ".to_string()),
            ..Overrides::default()
        };
        let err = build(ConfigFile::default(), overrides, no_prompt).unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_rejects_zero_limits_and_bad_auth() {
        let mut zero = minimal();
        zero.concurrency = Some(0);
        let err = build(zero, Overrides::default(), no_prompt).unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let overrides = Overrides {
            timeout_secs: Some(0),
            ..Overrides::default()
        };
        assert!(build(minimal(), overrides, no_prompt).is_err());

        let mut bad = minimal();
        bad.auth = Some("ntlm".to_string());
        let err = build(bad, Overrides::default(), no_prompt).unwrap_err();
        assert!(err.to_string().contains("ntlm"));
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let parsed = file(
            r#"
url = "https://dav.example.com/"
colour = "blue"
"#,
        );
        assert_eq!(parsed.url.as_deref(), Some("https://dav.example.com/"));
    }

    #[test]
    fn test_password_command_first_line() {
        let mut config = minimal();
        config.password = None;
        config.password_command = Some("printf 'from-command\\nignored\\n'".to_string());

        let resolved = build(config, Overrides::default(), no_prompt).unwrap();
        assert_eq!(resolved.password, "from-command");
    }

    #[test]
    fn test_failing_password_command() {
        let mut config = minimal();
        config.password = None;
        config.password_command = Some("exit 3".to_string());

        assert!(build(config, Overrides::default(), no_prompt).is_err());
    }

    #[test]
    fn test_prompt_is_last_resort() {
        let mut config = minimal();
        config.password = None;
        let asked = Cell::new(false);

        let resolved = build(config, Overrides::default(), |user: &str| {
            asked.set(true);
            assert_eq!(user, "alice");
            Ok("typed".to_string())
        })
        .unwrap();

        assert!(asked.get());
        assert_eq!(resolved.password, "typed");
    }

    #[test]
    fn test_explicit_config_path() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(resolve(Overrides::default(), Some(&missing), no_prompt).is_err());

        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "url = \"https://dav.example.com/\"\nuser = \"bob\"\npassword = \"pw\"\n",
        )
        .unwrap();
        let config = resolve(Overrides::default(), Some(&path), no_prompt).unwrap();
        assert_eq!(config.user, "bob");
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/contacts.tsv"));
        if let Some(home) = home::home_dir() {
            assert_eq!(expanded, home.join("contacts.tsv"));
        }
        assert_eq!(
            expand_tilde(Path::new("/abs/contacts.tsv")),
            PathBuf::from("/abs/contacts.tsv")
        );
    }
}
