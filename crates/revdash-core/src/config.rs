use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "REVDASH_CONFIG";

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "revdash.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Development mode: empty stores start polling from a recent instant
    /// instead of the beginning of history.
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Soft deadline for one invocation; loaders stop early and ask for more
    /// work once it passes.
    #[serde(default = "default_work_deadline_secs")]
    pub work_deadline_secs: u64,
    /// Hard ceiling for one `work` drain.
    #[serde(default = "default_invocation_ceiling_secs")]
    pub invocation_ceiling_secs: u64,
    /// Pending tasks older than this no longer block a re-enqueue under the
    /// same name.
    #[serde(default = "default_task_retention_hours")]
    pub task_retention_hours: u64,
    /// Sleep between iterations of `revdash run`.
    #[serde(default = "default_run_interval_secs")]
    pub run_interval_secs: u64,
}

impl SchedulerConfig {
    #[must_use]
    pub const fn work_deadline(&self) -> Duration {
        Duration::from_secs(self.work_deadline_secs)
    }

    #[must_use]
    pub const fn invocation_ceiling(&self) -> Duration {
        Duration::from_secs(self.invocation_ceiling_secs)
    }

    #[must_use]
    pub const fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_hours * 3600)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            work_deadline_secs: default_work_deadline_secs(),
            invocation_ceiling_secs: default_invocation_ceiling_secs(),
            task_retention_hours: default_task_retention_hours(),
            run_interval_secs: default_run_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_review_base_url")]
    pub base_url: String,
    /// Mailing-list groups whose reviews are mirrored. The first one is the
    /// dashboard's default reviewer.
    #[serde(default = "default_review_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_group_domain")]
    pub group_domain: String,
    #[serde(default = "default_review_page_size")]
    pub page_size: usize,
    /// Addresses whose LGTMs count and who can be assigned as reviewers.
    #[serde(default)]
    pub committers: Vec<String>,
    /// Mail domain aliases, e.g. `google.com -> golang.org`.
    #[serde(default = "default_alias_domains")]
    pub alias_domains: BTreeMap<String, String>,
    /// Repository name that gets no directory prefix on the dashboard.
    #[serde(default = "default_main_repo")]
    pub main_repo: String,
    /// Hosting prefix stripped from repository paths of the main project.
    #[serde(default = "default_repo_host_prefix")]
    pub repo_host_prefix: String,
    /// Initial checkpoint in dev mode (service time format, UTC).
    #[serde(default = "default_review_dev_start")]
    pub dev_start: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            base_url: default_review_base_url(),
            groups: default_review_groups(),
            group_domain: default_group_domain(),
            page_size: default_review_page_size(),
            committers: Vec::new(),
            alias_domains: default_alias_domains(),
            main_repo: default_main_repo(),
            repo_host_prefix: default_repo_host_prefix(),
            dev_start: default_review_dev_start(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_base_url")]
    pub base_url: String,
    #[serde(default = "default_tracker_project")]
    pub project: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Initial checkpoint for an empty store.
    #[serde(default = "default_tracker_start")]
    pub start: DateTime<Utc>,
    /// Initial window in dev mode, counted back from now.
    #[serde(default = "default_dev_window_hours")]
    pub dev_window_hours: u64,
    /// Environment variable holding the bearer token for outbound comments.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: default_tracker_base_url(),
            project: default_tracker_project(),
            max_results: default_max_results(),
            start: default_tracker_start(),
            dev_window_hours: default_dev_window_hours(),
            token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Only open issues carrying this label are shown.
    #[serde(default = "default_release_label")]
    pub release_label: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            release_label: default_release_label(),
        }
    }
}

/// Pick the config file to load.
///
/// Precedence: explicit path, `REVDASH_CONFIG`, `./revdash.toml`, then the
/// per-user config directory. Returns `None` when nothing exists.
#[must_use]
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_value: Option<&str>,
    cwd: &Path,
    user_config_dir: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_value.filter(|v| !v.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = cwd.join(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    user_config_dir
        .map(|dir| dir.join("revdash/config.toml"))
        .filter(|path| path.exists())
}

/// Parse one config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<Config>(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve and load the effective configuration.
///
/// # Errors
///
/// Returns an error if a config file was found but could not be parsed.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let env_value = std::env::var(CONFIG_ENV).ok();
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let user_dir = dirs::config_dir();

    match resolve_config_path(explicit, env_value.as_deref(), &cwd, user_dir.as_deref()) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            load_config_file(&path)
        }
        None => Ok(Config::default()),
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("revdash.sqlite3")
}

const fn default_work_deadline_secs() -> u64 {
    5 * 60
}

const fn default_invocation_ceiling_secs() -> u64 {
    10 * 60
}

const fn default_task_retention_hours() -> u64 {
    24
}

const fn default_run_interval_secs() -> u64 {
    60
}

fn default_review_base_url() -> String {
    "https://codereview.appspot.com".to_string()
}

fn default_review_groups() -> Vec<String> {
    vec!["golang-dev".to_string(), "golang-codereviews".to_string()]
}

fn default_group_domain() -> String {
    "googlegroups.com".to_string()
}

const fn default_review_page_size() -> usize {
    100
}

fn default_alias_domains() -> BTreeMap<String, String> {
    BTreeMap::from([("google.com".to_string(), "golang.org".to_string())])
}

fn default_main_repo() -> String {
    "go".to_string()
}

fn default_repo_host_prefix() -> String {
    "code.google.com/p/".to_string()
}

fn default_review_dev_start() -> String {
    "2013-12-01 00:00:00".to_string()
}

fn default_tracker_base_url() -> String {
    "https://code.google.com".to_string()
}

fn default_tracker_project() -> String {
    "go".to_string()
}

const fn default_max_results() -> usize {
    500
}

fn default_tracker_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

const fn default_dev_window_hours() -> u64 {
    24
}

fn default_token_env() -> String {
    "REVDASH_TRACKER_TOKEN".to_string()
}

fn default_release_label() -> String {
    "Release-Go1.3".to_string()
}
