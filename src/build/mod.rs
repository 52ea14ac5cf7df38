//! Per-platform `make docker-image` runs.
//!
//! Each platform with staged images and a builder directory in the checkout
//! becomes a [`BuildTarget`]. Targets run on a bounded rayon pool and every
//! run ends in a [`BuildOutcome`]; a failing build is data, not an error.

pub mod checkout;
pub mod process;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::Platform;
use crate::config::BuildSettings;
use crate::lifecycle::LifecycleGuard;
use crate::report::RunReport;

/// Platform to builder directory (relative to the checkout).
#[derive(Debug, Clone)]
pub struct BuilderMap {
    dirs: BTreeMap<Platform, PathBuf>,
    skipped: BTreeSet<Platform>,
}

impl Default for BuilderMap {
    fn default() -> Self {
        let dirs = Platform::ALL
            .into_iter()
            .filter_map(|p| p.default_builder_dir().map(|dir| (p, PathBuf::from(dir))))
            .collect();
        Self {
            dirs,
            skipped: BTreeSet::new(),
        }
    }
}

impl BuilderMap {
    pub fn empty() -> Self {
        Self {
            dirs: BTreeMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    pub fn set_dir(&mut self, platform: Platform, dir: impl Into<PathBuf>) {
        self.dirs.insert(platform, dir.into());
    }

    /// Exclude a platform from building.
    pub fn skip(&mut self, platform: Platform) {
        self.skipped.insert(platform);
    }

    pub fn dir_for(&self, platform: Platform) -> Option<&Path> {
        self.dirs.get(&platform).map(PathBuf::as_path)
    }

    pub fn is_skipped(&self, platform: Platform) -> bool {
        self.skipped.contains(&platform)
    }

    pub fn is_build_relevant(&self, platform: Platform) -> bool {
        !self.is_skipped(platform) && self.dirs.contains_key(&platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildSkip {
    NoImages,
    BuilderMissing,
    NoBuilder,
    Unsupported,
    Cancelled,
}

impl fmt::Display for BuildSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildSkip::NoImages => "no images staged",
            BuildSkip::BuilderMissing => "builder missing in checkout",
            BuildSkip::NoBuilder => "no builder",
            BuildSkip::Unsupported => "excluded by configuration",
            BuildSkip::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    #[default]
    Pending,
    Succeeded {
        images: Vec<String>,
    },
    Failed {
        exit_code: Option<i32>,
        message: String,
        output: String,
    },
    Skipped {
        reason: BuildSkip,
    },
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildOutcome::Pending => f.write_str("pending"),
            BuildOutcome::Succeeded { images } => write!(f, "built {}", images.join(", ")),
            BuildOutcome::Failed { message, .. } => write!(f, "failed: {message}"),
            BuildOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// One platform build in the checkout.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub platform: Platform,
    pub directory: PathBuf,
    pub command: Vec<String>,
    pub sources_present: bool,
    pub versions: Vec<String>,
    /// Staged build files (and extras such as `vswitch.xml`) removed after a
    /// successful build.
    pub staged_files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct BuildPlan {
    pub targets: Vec<BuildTarget>,
    pub skipped: Vec<(Platform, BuildSkip)>,
}

pub struct BuildOrchestrator<'a> {
    settings: &'a BuildSettings,
    guard: &'a LifecycleGuard,
}

impl<'a> BuildOrchestrator<'a> {
    pub fn new(settings: &'a BuildSettings, guard: &'a LifecycleGuard) -> Self {
        Self { settings, guard }
    }

    /// Decide, per reported platform, whether it builds or why it does not.
    pub fn plan(&self, report: &RunReport, builders: &BuilderMap, checkout: &Path) -> BuildPlan {
        let mut plan = BuildPlan::default();

        for (platform, entry) in report.platforms() {
            let skip = |plan: &mut BuildPlan, reason: BuildSkip| plan.skipped.push((platform, reason));

            if builders.is_skipped(platform) {
                skip(&mut plan, BuildSkip::Unsupported);
                continue;
            }
            let Some(relative) = builders.dir_for(platform) else {
                skip(&mut plan, BuildSkip::NoBuilder);
                continue;
            };
            if entry.staged == 0 {
                skip(&mut plan, BuildSkip::NoImages);
                continue;
            }
            let directory = checkout.join(relative);
            if !directory.join("Makefile").is_file() {
                warn!(
                    "{platform}: no Makefile in {}; not building",
                    directory.display()
                );
                skip(&mut plan, BuildSkip::BuilderMissing);
                continue;
            }

            let staged_files: Vec<PathBuf> = entry.build_files.iter().cloned().collect();
            let sources_present =
                !staged_files.is_empty() && staged_files.iter().all(|f| f.is_file());
            plan.targets.push(BuildTarget {
                platform,
                directory,
                command: self.settings.command.clone(),
                sources_present,
                versions: entry.versions.iter().cloned().collect(),
                staged_files,
            });
        }

        plan
    }

    /// Run all targets on a pool of `build.jobs` threads.
    ///
    /// Results come back in target order.
    pub fn run(&self, targets: &[BuildTarget]) -> Result<Vec<(Platform, BuildOutcome)>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.jobs.max(1))
            .thread_name(|i| format!("build-{i}"))
            .build()
            .context("creating build thread pool")?;

        Ok(pool.install(|| {
            targets
                .par_iter()
                .map(|target| (target.platform, self.build_one(target)))
                .collect()
        }))
    }

    fn build_one(&self, target: &BuildTarget) -> BuildOutcome {
        let platform = target.platform;
        if self.guard.is_cancelled() {
            return BuildOutcome::Skipped {
                reason: BuildSkip::Cancelled,
            };
        }
        if !target.sources_present {
            warn!("{platform}: staged build files are missing; not building");
            return BuildOutcome::Skipped {
                reason: BuildSkip::NoImages,
            };
        }

        info!(
            "{platform}: running '{}' in {}",
            target.command.join(" "),
            target.directory.display()
        );
        let outcome = match process::run_captured(&target.command, &target.directory, self.guard)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("{platform}: could not start build: {err}");
                return BuildOutcome::Failed {
                    exit_code: None,
                    message: format!("could not start '{}': {err}", target.command.join(" ")),
                    output: String::new(),
                };
            }
        };

        let output = outcome.combined();
        for line in output.lines() {
            debug!(target: "refplat_builder::build::output", "{platform}: {line}");
        }

        if !outcome.success() {
            let message = match outcome.exit_code() {
                Some(code) => format!("build exited with status {code}"),
                None => "build terminated by signal".to_string(),
            };
            warn!("{platform}: {message}");
            return BuildOutcome::Failed {
                exit_code: outcome.exit_code(),
                message,
                output,
            };
        }

        let mut images = parse_image_tags(&output);
        if images.is_empty() {
            images = target
                .versions
                .iter()
                .map(|v| format!("vrnetlab/cisco_{}:{v}", platform.slug()))
                .collect();
        }
        remove_staged_files(target);
        info!("{platform}: built {}", images.join(", "));
        BuildOutcome::Succeeded { images }
    }
}

/// Image tags reported by docker in build output, in order, deduplicated.
pub fn parse_image_tags(output: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for line in output.lines() {
        let rest = line
            .split_once("Successfully tagged ")
            .or_else(|| line.split_once("naming to docker.io/"))
            .map(|(_, rest)| rest);
        let Some(tag) = rest.and_then(|r| r.split_whitespace().next()) else {
            continue;
        };
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

fn remove_staged_files(target: &BuildTarget) {
    for file in &target.staged_files {
        match fs::remove_file(file) {
            Ok(()) => debug!("removed {}", file.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove {}: {err}", file.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(script: &str, jobs: usize) -> BuildSettings {
        BuildSettings {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            jobs,
            grace_period: Duration::from_secs(1),
        }
    }

    fn target(dir: &Path, platform: Platform, files: &[&str]) -> BuildTarget {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("Makefile"), "docker-image:\n").unwrap();
        let staged_files = files
            .iter()
            .map(|f| {
                let path = dir.join(f);
                fs::write(&path, b"image").unwrap();
                path
            })
            .collect();
        BuildTarget {
            platform,
            directory: dir.to_path_buf(),
            command: Vec::new(),
            sources_present: true,
            versions: vec!["17.03.08".to_string()],
            staged_files,
        }
    }

    #[test]
    fn test_parses_docker_tags() {
        let output = "\
Step 1/5 : FROM debian
Successfully tagged vrnetlab/cisco_csr1000v:17.03.08
#12 naming to docker.io/vrnetlab/cisco_iol:L2-17.16.01a done
#13 naming to docker.io/vrnetlab/cisco_iol:L2-17.16.01a done";
        assert_eq!(
            parse_image_tags(output),
            vec![
                "vrnetlab/cisco_csr1000v:17.03.08".to_string(),
                "vrnetlab/cisco_iol:L2-17.16.01a".to_string(),
            ]
        );
        assert!(parse_image_tags("nothing here").is_empty());
    }

    #[test]
    fn test_one_failure_does_not_stop_other_builds() {
        let tmp = TempDir::new().unwrap();
        let settings = settings("test ! -f fail-here && echo 'naming to docker.io/vrnetlab/x:1 done'", 2);
        let guard = LifecycleGuard::new();
        let orchestrator = BuildOrchestrator::new(&settings, &guard);

        let mut failing = target(&tmp.path().join("cisco/asav"), Platform::Asav, &["asav9-23-1.qcow2"]);
        fs::write(failing.directory.join("fail-here"), b"").unwrap();
        failing.command = settings.command.clone();
        let mut passing = target(
            &tmp.path().join("cisco/csr1000v"),
            Platform::Csr1000v,
            &["csr1000v-universalk9.17.03.08-serial.qcow2"],
        );
        passing.command = settings.command.clone();

        let results = orchestrator.run(&[failing.clone(), passing.clone()]).unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            (Platform::Asav, BuildOutcome::Failed { exit_code: Some(1), .. })
        ));
        assert_eq!(
            results[1],
            (
                Platform::Csr1000v,
                BuildOutcome::Succeeded {
                    images: vec!["vrnetlab/x:1".to_string()]
                }
            )
        );

        // staged files stay for a failed build and go after a successful one
        assert!(failing.staged_files[0].exists());
        assert!(!passing.staged_files[0].exists());
    }

    #[test]
    fn test_missing_tags_fall_back_to_versions() {
        let tmp = TempDir::new().unwrap();
        let settings = settings("true", 1);
        let guard = LifecycleGuard::new();
        let mut t = target(&tmp.path().join("cisco/csr1000v"), Platform::Csr1000v, &["a.qcow2"]);
        t.command = settings.command.clone();

        let results = BuildOrchestrator::new(&settings, &guard).run(&[t]).unwrap();
        assert_eq!(
            results[0].1,
            BuildOutcome::Succeeded {
                images: vec!["vrnetlab/cisco_csr1000v:17.03.08".to_string()]
            }
        );
    }

    #[test]
    fn test_cancelled_runs_start_nothing() {
        let tmp = TempDir::new().unwrap();
        let settings = settings("touch started", 1);
        let guard = LifecycleGuard::new();
        guard.cancel();
        let mut t = target(&tmp.path().join("cisco/iol"), Platform::Iol, &["cisco_iol-x.bin"]);
        t.command = settings.command.clone();

        let results = BuildOrchestrator::new(&settings, &guard).run(&[t.clone()]).unwrap();
        assert_eq!(
            results[0].1,
            BuildOutcome::Skipped {
                reason: BuildSkip::Cancelled
            }
        );
        assert!(!t.directory.join("started").exists());
    }

    #[test]
    fn test_spawn_failure_is_recorded_as_failure() {
        let tmp = TempDir::new().unwrap();
        let settings = BuildSettings {
            command: vec!["definitely_not_a_real_command_12345".to_string()],
            jobs: 1,
            grace_period: Duration::from_secs(1),
        };
        let guard = LifecycleGuard::new();
        let mut t = target(&tmp.path().join("cisco/ise"), Platform::Ise, &["cisco-ise.qcow2"]);
        t.command = settings.command.clone();

        let results = BuildOrchestrator::new(&settings, &guard).run(&[t]).unwrap();
        assert!(matches!(
            results[0].1,
            BuildOutcome::Failed { exit_code: None, .. }
        ));
    }

    #[test]
    fn test_builder_map_defaults() {
        let mut builders = BuilderMap::default();
        assert_eq!(builders.dir_for(Platform::Iol), Some(Path::new("cisco/iol")));
        assert!(builders.dir_for(Platform::C9800cl).is_none());
        assert!(builders.is_build_relevant(Platform::Ise));
        builders.skip(Platform::Ise);
        assert!(!builders.is_build_relevant(Platform::Ise));
    }
}
