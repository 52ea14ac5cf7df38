//! Run configuration: built-in defaults, then an optional TOML file, then
//! command-line overrides applied by the binary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::build::BuilderMap;
use crate::classify::{Classifier, Platform, Rule, RuleSpec};
use crate::error::Error;

pub const DEFAULT_REPO_URL: &str = "https://github.com/srl-labs/vrnetlab.git";
pub const DEFAULT_SOURCE_DIR: &str = "refplats";
pub const DEFAULT_OUTPUT_DIR: &str = "refplat-images";
pub const DEFAULT_CHECKOUT_DIR: &str = "vrnetlab";
pub const LOCAL_CONFIG_FILE: &str = "refplat-builder.toml";

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub repo_url: String,
    pub dir: PathBuf,
    pub update: bool,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub command: Vec<String>,
    pub jobs: usize,
    /// How long in-flight builds may keep running after a termination signal.
    pub grace_period: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: vec!["make".to_string(), "docker-image".to_string()],
            jobs: 1,
            grace_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub checkout: CheckoutSettings,
    pub build: BuildSettings,
    pub builders: BuilderMap,
    /// Extra rules evaluated before the built-in table.
    pub rules: Vec<Rule>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from(DEFAULT_SOURCE_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            checkout: CheckoutSettings {
                repo_url: DEFAULT_REPO_URL.to_string(),
                dir: PathBuf::from(DEFAULT_CHECKOUT_DIR),
                update: true,
            },
            build: BuildSettings::default(),
            builders: BuilderMap::default(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    checkout: Option<CheckoutToml>,
    build: Option<BuildToml>,
    builders: Option<BTreeMap<String, String>>,
    rules: Option<Vec<RuleSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckoutToml {
    repo_url: Option<String>,
    dir: Option<PathBuf>,
    update: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    command: Option<Vec<String>>,
    jobs: Option<usize>,
    grace_period_secs: Option<u64>,
    skip_platforms: Option<Vec<Platform>>,
}

impl RunConfig {
    /// Defaults overlaid with the configuration file, if one is found.
    pub fn load(explicit: Option<&Path>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(path) = find_config_file(explicit)? {
            config.apply_file(&path)?;
        }
        Ok(config)
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<(), Error> {
        let invalid = |reason: String| Error::Config {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| invalid(format!("reading: {e}")))?;
        let parsed: ConfigToml =
            toml::from_str(&text).map_err(|e| invalid(format!("parsing: {e}")))?;
        self.apply(parsed).map_err(invalid)
    }

    fn apply(&mut self, parsed: ConfigToml) -> Result<(), String> {
        if let Some(checkout) = parsed.checkout {
            if let Some(url) = checkout.repo_url {
                self.checkout.repo_url = url;
            }
            if let Some(dir) = checkout.dir {
                self.checkout.dir = dir;
            }
            if let Some(update) = checkout.update {
                self.checkout.update = update;
            }
        }

        if let Some(build) = parsed.build {
            if let Some(command) = build.command {
                if command.is_empty() {
                    return Err("build.command must not be empty".to_string());
                }
                self.build.command = command;
            }
            if let Some(jobs) = build.jobs {
                if jobs == 0 {
                    return Err("build.jobs must be at least 1".to_string());
                }
                self.build.jobs = jobs;
            }
            if let Some(secs) = build.grace_period_secs {
                self.build.grace_period = Duration::from_secs(secs);
            }
            for platform in build.skip_platforms.unwrap_or_default() {
                self.builders.skip(platform);
            }
        }

        for (key, dir) in parsed.builders.unwrap_or_default() {
            let platform: Platform = key.parse().map_err(|e| format!("builders: {e}"))?;
            self.builders.set_dir(platform, dir);
        }

        for spec in parsed.rules.unwrap_or_default() {
            let rule = spec
                .compile()
                .map_err(|e| format!("rule '{}': {e}", spec.name))?;
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Built-in table with configured rules in front.
    pub fn classifier(&self) -> Classifier {
        Classifier::builtin().with_overrides(self.rules.clone())
    }
}

/// `--config` path, else `./refplat-builder.toml`, else the per-user config.
///
/// An explicit path must exist; the others are optional.
pub fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>, Error> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(Error::Config {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Ok(Some(local));
    }
    Ok(dirs::config_dir()
        .map(|dir| dir.join("refplat-builder").join("config.toml"))
        .filter(|path| path.is_file()))
}
