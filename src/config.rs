use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;
use crate::pagination::{PaginationOptions, SizePolicy};

const DEFAULT_ENV_PREFIX: &str = "BLOGVIEW";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config: api.{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub oauth_token_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            oauth_token: String::new(),
            oauth_token_secret: String::new(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("consumer_key", &self.consumer_key),
            ("consumer_secret", &self.consumer_secret),
            ("oauth_token", &self.oauth_token),
            ("oauth_token_secret", &self.oauth_token_secret),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "https://api.tumblr.com/v2/".into()
}

fn default_user_agent() -> String {
    format!("blogview/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerConfig {
    #[serde(default = "default_posts_per_page")]
    pub posts_per_page: u32,
    #[serde(default)]
    pub fullsize_photos: bool,
    #[serde(default = "default_preferred_size")]
    pub photo_preferred_size: u32,
    #[serde(default = "default_true")]
    pub exact_size_required: bool,
    #[serde(default = "default_max_links")]
    pub max_links_per_menu: usize,
    #[serde(default = "default_true")]
    pub load_avatar_menu_icons: bool,
    #[serde(default = "default_avatar_timeout", with = "humantime_serde")]
    pub avatar_timeout: Duration,
    #[serde(default = "default_relationship_page_size")]
    pub relationship_page_size: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            posts_per_page: default_posts_per_page(),
            fullsize_photos: false,
            photo_preferred_size: default_preferred_size(),
            exact_size_required: true,
            max_links_per_menu: default_max_links(),
            load_avatar_menu_icons: true,
            avatar_timeout: default_avatar_timeout(),
            relationship_page_size: default_relationship_page_size(),
        }
    }
}

fn default_posts_per_page() -> u32 {
    20
}

fn default_preferred_size() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_max_links() -> usize {
    30
}

fn default_avatar_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_relationship_page_size() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    crate::task::DEFAULT_WORKERS
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        let viewer = &self.viewer;
        EngineOptions {
            pagination: PaginationOptions {
                page_size: viewer.posts_per_page,
                size_policy: SizePolicy::from_options(
                    viewer.fullsize_photos,
                    viewer.photo_preferred_size,
                    viewer.exact_size_required,
                ),
            },
            workers: self.tasks.workers,
            max_links_per_menu: viewer.max_links_per_menu,
            load_avatar_menu_icons: viewer.load_avatar_menu_icons,
            relationship_page_size: viewer.relationship_page_size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = merge_config(cfg, read_config_file(path)?);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = merge_config(cfg, read_config_file(&default_path)?);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&data).with_context(|| format!("config: parse {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let api = other.api;
    for (slot, value) in [
        (&mut base.api.consumer_key, api.consumer_key),
        (&mut base.api.consumer_secret, api.consumer_secret),
        (&mut base.api.oauth_token, api.oauth_token),
        (&mut base.api.oauth_token_secret, api.oauth_token_secret),
        (&mut base.api.base_url, api.base_url),
        (&mut base.api.user_agent, api.user_agent),
    ] {
        if !value.trim().is_empty() {
            *slot = value;
        }
    }
    base.api.timeout = api.timeout;

    let viewer = other.viewer;
    if viewer.posts_per_page != 0 {
        base.viewer.posts_per_page = viewer.posts_per_page;
    }
    if viewer.photo_preferred_size != 0 {
        base.viewer.photo_preferred_size = viewer.photo_preferred_size;
    }
    if viewer.max_links_per_menu != 0 {
        base.viewer.max_links_per_menu = viewer.max_links_per_menu;
    }
    if viewer.relationship_page_size != 0 {
        base.viewer.relationship_page_size = viewer.relationship_page_size;
    }
    base.viewer.fullsize_photos = viewer.fullsize_photos;
    base.viewer.exact_size_required = viewer.exact_size_required;
    base.viewer.load_avatar_menu_icons = viewer.load_avatar_menu_icons;
    base.viewer.avatar_timeout = viewer.avatar_timeout;

    if other.tasks.workers != 0 {
        base.tasks.workers = other.tasks.workers;
    }

    base
}

// Overlays `PREFIX_SECTION__KEY` variables onto `cfg`. Values that do not
// parse are ignored.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let map: HashMap<String, String> = env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect();

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.consumer_key" => cfg.api.consumer_key = value,
        "api.consumer_secret" => cfg.api.consumer_secret = value,
        "api.oauth_token" => cfg.api.oauth_token = value,
        "api.oauth_token_secret" => cfg.api.oauth_token_secret = value,
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => set_duration(&mut cfg.api.timeout, &value),
        "viewer.posts_per_page" => set_parsed(&mut cfg.viewer.posts_per_page, &value),
        "viewer.fullsize_photos" => cfg.viewer.fullsize_photos = parse_bool(&value),
        "viewer.photo_preferred_size" => set_parsed(&mut cfg.viewer.photo_preferred_size, &value),
        "viewer.exact_size_required" => cfg.viewer.exact_size_required = parse_bool(&value),
        "viewer.max_links_per_menu" => set_parsed(&mut cfg.viewer.max_links_per_menu, &value),
        "viewer.load_avatar_menu_icons" => cfg.viewer.load_avatar_menu_icons = parse_bool(&value),
        "viewer.avatar_timeout" => set_duration(&mut cfg.viewer.avatar_timeout, &value),
        "viewer.relationship_page_size" => {
            set_parsed(&mut cfg.viewer.relationship_page_size, &value)
        }
        "tasks.workers" => set_parsed(&mut cfg.tasks.workers, &value),
        _ => {}
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.trim().parse::<T>() {
        *slot = parsed;
    }
}

fn set_duration(slot: &mut Duration, value: &str) {
    if let Ok(duration) = humantime::parse_duration(value.trim()) {
        *slot = duration;
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("blogview").join("config.yaml"))
}

pub struct Credentials<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    pub oauth_token: &'a str,
    pub oauth_token_secret: &'a str,
}

// Writes the four OAuth values into the `api` section of the config file,
// keeping everything else already in it.
pub fn save_credentials(path: Option<PathBuf>, credentials: Credentials<'_>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => default_config_path().context("config: unable to determine default config path")?,
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };

    cfg.api.consumer_key = credentials.consumer_key.trim().to_string();
    cfg.api.consumer_secret = credentials.consumer_secret.trim().to_string();
    cfg.api.oauth_token = credentials.oauth_token.trim().to_string();
    cfg.api.oauth_token_secret = credentials.oauth_token_secret.trim().to_string();
    cfg.api.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: serialize")?;
    fs::write(&path, contents).with_context(|| format!("config: write {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    fn missing_file() -> LoadOptions {
        LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/blogview.yaml")),
            env_prefix: Some("BLOGVIEW_TEST_NONE".into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(missing_file()).unwrap();
        assert_eq!(cfg.api.base_url, "https://api.tumblr.com/v2/");
        assert_eq!(cfg.viewer.posts_per_page, 20);
        assert!(cfg.viewer.exact_size_required);
        assert_eq!(cfg.viewer.avatar_timeout, Duration::from_secs(30));
        assert_eq!(cfg.tasks.workers, 8);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "api:\n  consumer_key: ck\n  timeout: 5s\nviewer:\n  posts_per_page: 40\n  exact_size_required: false\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("BLOGVIEW_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.consumer_key, "ck");
        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.api.user_agent, default_user_agent());
        assert_eq!(cfg.viewer.posts_per_page, 40);
        assert_eq!(cfg.viewer.photo_preferred_size, 500);
        assert_eq!(
            cfg.engine_options().pagination.size_policy,
            SizePolicy::Preferred(500)
        );
    }

    #[test]
    fn save_credentials_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        save_credentials(
            Some(path.clone()),
            Credentials {
                consumer_key: "ck",
                consumer_secret: "cs",
                oauth_token: " tok ",
                oauth_token_secret: "ts",
            },
        )
        .unwrap();
        let saved = read_config_file(&path).unwrap();
        assert_eq!(saved.api.oauth_token, "tok");
        assert!(saved.api.validate().is_ok());
    }

    #[test]
    fn save_credentials_rejects_blank_values() {
        let dir = tempdir().unwrap();
        let err = save_credentials(
            Some(dir.path().join("config.yaml")),
            Credentials {
                consumer_key: "ck",
                consumer_secret: "",
                oauth_token: "tok",
                oauth_token_secret: "ts",
            },
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::Missing("consumer_secret"))
        );
    }

    #[test]
    fn env_overrides() {
        env::set_var("BLOGVIEW_TEST_ENV_VIEWER__POSTS_PER_PAGE", "50");
        env::set_var("BLOGVIEW_TEST_ENV_VIEWER__FULLSIZE_PHOTOS", "true");
        env::set_var("BLOGVIEW_TEST_ENV_TASKS__WORKERS", "not a number");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/blogview.yaml")),
            env_prefix: Some("BLOGVIEW_TEST_ENV".into()),
        })
        .unwrap();
        env::remove_var("BLOGVIEW_TEST_ENV_VIEWER__POSTS_PER_PAGE");
        env::remove_var("BLOGVIEW_TEST_ENV_VIEWER__FULLSIZE_PHOTOS");
        env::remove_var("BLOGVIEW_TEST_ENV_TASKS__WORKERS");

        assert_eq!(cfg.viewer.posts_per_page, 50);
        assert_eq!(cfg.tasks.workers, 8);
        assert_eq!(cfg.engine_options().pagination.size_policy, SizePolicy::FullSize);
    }
}
