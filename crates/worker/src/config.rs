//! Server profile and behavior knobs for a worker.

use std::time::Duration;

use datacon::{DownloadConfig, UploadConfig};
use netio::ProxySetup;
use zeroize::Zeroizing;

/// Which command a keep-alive cycle sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeepAliveCommand {
    /// `NOOP`, ignored by every server.
    #[default]
    Noop,
    /// `PWD`, for servers that do not count `NOOP` as activity.
    Pwd,
}

impl KeepAliveCommand {
    /// The command line to send, without the terminator.
    #[must_use]
    pub fn line(self) -> &'static str {
        match self {
            KeepAliveCommand::Noop => "NOOP",
            KeepAliveCommand::Pwd => "PWD",
        }
    }
}

/// Keeps an idle control connection from aging out server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeepAliveConfig {
    /// Command to issue.
    pub command: KeepAliveCommand,
    /// How often to issue it while sleeping.
    pub send_every: Duration,
    /// Give up keeping the connection alive after this much idleness; the
    /// server's own timeout closes it from there.
    pub stop_after: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            command: KeepAliveCommand::Noop,
            send_every: Duration::from_secs(60),
            stop_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Login credentials. The password is wiped from memory on drop.
#[derive(Clone, Default)]
pub struct Credentials {
    /// `USER` argument; empty means anonymous.
    pub user: String,
    /// `PASS` argument.
    pub password: Zeroizing<String>,
    /// `ACCT` argument for servers that ask for one.
    pub account: Option<String>,
}

impl Credentials {
    /// Anonymous login with the conventional password.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user: "anonymous".to_owned(),
            password: Zeroizing::new("anonymous@".to_owned()),
            account: None,
        }
    }

    /// Username/password login.
    #[must_use]
    pub fn login(user: &str, password: &str) -> Self {
        Self {
            user: user.to_owned(),
            password: Zeroizing::new(password.to_owned()),
            account: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("account", &self.account)
            .finish()
    }
}

/// Everything needed to reach and log into one server.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Hostname or IPv4 literal of the server.
    pub host: String,
    /// Control connection port.
    pub port: u16,
    /// Login credentials.
    pub credentials: Credentials,
    /// Pre-rendered login command lines replacing the stock
    /// `USER`/`PASS`/`ACCT` sequence; the templating that produces them is
    /// the caller's business. Intermediate (3xx) replies advance the
    /// script, transient or permanent failures abort the login.
    pub login_script: Option<Vec<String>>,
    /// Proxy to tunnel both the control and data connections through.
    pub proxy: Option<ProxySetup>,
    /// Passive mode (`PASV`) rather than active (`PORT`).
    pub passive: bool,
    /// Ask for MODE Z compression after login; silently disabled when the
    /// server refuses.
    pub compress: bool,
    /// Commands sent once after login, each awaiting its reply. Failures
    /// are logged and skipped.
    pub init_commands: Vec<String>,
}

impl ServerProfile {
    /// Profile for `host:port` with `credentials` and every toggle at its
    /// default (passive, no proxy, no compression).
    #[must_use]
    pub fn new(host: &str, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.to_owned(),
            port,
            credentials,
            login_script: None,
            proxy: None,
            passive: true,
            compress: false,
            init_commands: Vec::new(),
        }
    }
}

/// Timing and retry knobs shared by every item a worker runs.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerConfig {
    /// How long one command may wait for its reply. The deadline is pushed
    /// back while an attached data connection is demonstrably moving bytes.
    pub command_timeout: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// How many reconnect attempts to make before giving up; a budget of 3
    /// means the 4th failure stops retrying.
    pub retry_budget: u32,
    /// Keep the control connection alive while sleeping, when set.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Download data connection knobs.
    pub download: DownloadConfig,
    /// Upload data connection knobs.
    pub upload: UploadConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(40),
            reconnect_delay: Duration::from_secs(20),
            retry_budget: 3,
            keep_alive: None,
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}
