//! The result record of one run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;

use crate::archive::ContainerFormat;
use crate::build::{BuildOutcome, BuildSkip};
use crate::classify::Platform;
use crate::fsutil::write_json_atomic;
use crate::plan::{ExtractionPlan, SkipReason, SkippedEntry};
use crate::stage::StagedImage;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlatformReport {
    pub staged: usize,
    pub versions: BTreeSet<String>,
    /// Files staged into the builder directory.
    pub build_files: BTreeSet<PathBuf>,
    pub outcome: BuildOutcome,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContainerStatus {
    Processed,
    UnsupportedFormat { reason: String },
    CorruptArchive { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub name: String,
    pub path: PathBuf,
    pub format: Option<ContainerFormat>,
    pub status: ContainerStatus,
    pub staged: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl ContainerReport {
    pub fn count(&self, wanted: fn(&SkipReason) -> bool) -> usize {
        self.skipped.iter().filter(|s| wanted(&s.reason)).count()
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: String,
    platforms: BTreeMap<Platform, PlatformReport>,
    containers: Vec<ContainerReport>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: now_utc_compact(),
            platforms: BTreeMap::new(),
            containers: Vec::new(),
        }
    }

    pub fn platforms(&self) -> impl Iterator<Item = (Platform, &PlatformReport)> {
        self.platforms.iter().map(|(p, r)| (*p, r))
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformReport> {
        self.platforms.get(&platform)
    }

    pub fn containers(&self) -> &[ContainerReport] {
        &self.containers
    }

    pub fn container(&self, name: &str) -> Option<&ContainerReport> {
        self.containers.iter().find(|c| c.name == name)
    }

    fn platform_mut(&mut self, platform: Platform) -> &mut PlatformReport {
        self.platforms.entry(platform).or_default()
    }

    /// Register every platform a plan touches.
    pub fn record_plan(&mut self, plan: &ExtractionPlan) {
        for task in &plan.tasks {
            self.platform_mut(task.identity.platform);
        }
    }

    pub fn record_staged(&mut self, image: &StagedImage) {
        let entry = self.platform_mut(image.identity.platform);
        entry.staged += 1;
        entry.versions.insert(image.identity.version.clone());
        if let Some(build_file) = &image.build_path {
            entry.build_files.insert(build_file.clone());
        }
    }

    /// Extra file placed in a builder directory, removed with the build files.
    pub fn record_build_extra(&mut self, platform: Platform, path: &Path) {
        self.platform_mut(platform)
            .build_files
            .insert(path.to_path_buf());
    }

    pub fn record_failure(&mut self, platform: Platform, message: impl Into<String>) {
        let entry = self.platform_mut(platform);
        if entry.first_error.is_none() {
            entry.first_error = Some(message.into());
        }
    }

    pub fn record_build(&mut self, platform: Platform, outcome: BuildOutcome) {
        if let BuildOutcome::Failed { message, .. } = &outcome {
            self.record_failure(platform, message.clone());
        }
        self.platform_mut(platform).outcome = outcome;
    }

    pub fn record_container(&mut self, container: ContainerReport) {
        self.containers.push(container);
    }

    /// Whether anything was recorded as failed or skipped for a fault.
    pub fn has_failures(&self) -> bool {
        self.platforms
            .values()
            .any(|p| p.first_error.is_some() || matches!(p.outcome, BuildOutcome::Failed { .. }))
            || self
                .containers
                .iter()
                .any(|c| c.status != ContainerStatus::Processed)
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Platforms:");
        if self.platforms.is_empty() {
            let _ = writeln!(out, "  (no images classified)");
        }
        for (platform, entry) in &self.platforms {
            let _ = writeln!(
                out,
                "  {:<10} {:>3} staged  {}",
                platform.display_name(),
                entry.staged,
                entry.outcome
            );
            if let Some(err) = &entry.first_error {
                let already_shown = matches!(&entry.outcome, BuildOutcome::Failed { message, .. } if message == err);
                if !already_shown {
                    let _ = writeln!(out, "  {:<10}     error: {err}", "");
                }
            }
        }

        let _ = writeln!(out, "Containers:");
        for container in &self.containers {
            match &container.status {
                ContainerStatus::Processed => {
                    let _ = writeln!(
                        out,
                        "  {}: {} staged, {} unclassified, {} ambiguous, {} superseded, {} empty",
                        container.name,
                        container.staged,
                        container.count(|r| matches!(r, SkipReason::Unclassified)),
                        container.count(|r| matches!(r, SkipReason::Ambiguous { .. })),
                        container.count(|r| matches!(r, SkipReason::Superseded { .. })),
                        container.count(|r| matches!(r, SkipReason::Empty)),
                    );
                }
                ContainerStatus::UnsupportedFormat { reason } => {
                    let _ = writeln!(out, "  {}: skipped, unsupported format ({reason})", container.name);
                }
                ContainerStatus::CorruptArchive { reason } => {
                    let _ = writeln!(out, "  {}: skipped, corrupt archive ({reason})", container.name);
                }
            }
        }

        let built: Vec<&String> = self
            .platforms
            .values()
            .filter_map(|p| match &p.outcome {
                BuildOutcome::Succeeded { images } => Some(images),
                _ => None,
            })
            .flatten()
            .collect();
        if !built.is_empty() {
            let _ = writeln!(out, "Built {} image(s):", built.len());
            for image in built {
                let _ = writeln!(out, "  {image}");
            }
        }
        out
    }

    pub fn skipped_builds(&self) -> impl Iterator<Item = (Platform, BuildSkip)> + '_ {
        self.platforms().filter_map(|(p, r)| match r.outcome {
            BuildOutcome::Skipped { reason } => Some((p, reason)),
            _ => None,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
