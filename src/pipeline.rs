//! One full run: containers in, staged images and builds out.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::archive::{container_name, Container, ContainerFormat};
use crate::build::checkout::ensure_checkout;
use crate::build::{BuildOrchestrator, BuildOutcome};
use crate::classify::Classifier;
use crate::config::RunConfig;
use crate::error::Error;
use crate::fsutil::{OutputLock, COPY_BUFFER};
use crate::lifecycle::LifecycleGuard;
use crate::plan::{ExtractionPlanner, NestedContainer, OutputNames};
use crate::preflight;
use crate::report::{ContainerReport, ContainerStatus, RunReport};
use crate::stage::StagingExecutor;

/// Run the whole pipeline under `guard`.
///
/// Registered scratch directories are removed before this returns, whether
/// the run succeeded or not.
pub fn run(config: &RunConfig, guard: &LifecycleGuard) -> Result<RunReport> {
    let result = Pipeline::new(config, guard).run();
    let removed = guard.complete();
    if removed > 0 {
        info!("removed {removed} scratch directories");
    }
    result
}

struct Pipeline<'a> {
    config: &'a RunConfig,
    guard: &'a LifecycleGuard,
    classifier: Classifier,
    names: OutputNames,
}

impl<'a> Pipeline<'a> {
    fn new(config: &'a RunConfig, guard: &'a LifecycleGuard) -> Self {
        Self {
            config,
            guard,
            classifier: config.classifier(),
            names: OutputNames::new(),
        }
    }

    fn run(&mut self) -> Result<RunReport> {
        let output = &self.config.output_dir;
        fs::create_dir_all(output).map_err(|e| Error::OutputRootUnavailable {
            path: output.clone(),
            reason: e.to_string(),
        })?;
        let _lock = OutputLock::acquire(output).map_err(|e| Error::OutputRootUnavailable {
            path: output.clone(),
            reason: format!("{e:#}"),
        })?;

        let status = ensure_checkout(&self.config.checkout)?;
        info!(?status, "vrnetlab checkout at {}", self.config.checkout.dir.display());

        let containers = discover_containers(&self.config.source_dir)?;
        if containers.is_empty() {
            warn!(
                "no .zip or .iso files found in {}",
                self.config.source_dir.display()
            );
        }

        let mut report = RunReport::new();
        for path in &containers {
            if self.guard.is_cancelled() {
                warn!("run cancelled; not processing {}", path.display());
                break;
            }
            self.process_container(path, &mut report)?;
        }

        self.build(&mut report)?;
        Ok(report)
    }

    fn process_container(&mut self, path: &Path, report: &mut RunReport) -> Result<()> {
        info!("processing {}", path.display());
        let mut container = match Container::open(path) {
            Ok(container) => container,
            Err(err) if err.is_container_skip() => {
                warn!("skipping {err}");
                report.record_container(skipped_container(path, err));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let output_name = self.names.claim(container.name(), container.format());
        if output_name != container.name() {
            info!(
                "{} shares its name with an earlier container; staging into {output_name}/",
                path.display()
            );
        }
        let planner = ExtractionPlanner::new(
            &self.classifier,
            &self.config.builders,
            &self.config.output_dir,
        );
        let plan = planner.plan_container(&container, &output_name);
        let staged = StagingExecutor::new(
            &self.config.output_dir,
            &self.config.checkout.dir,
            &self.config.builders,
        )
        .execute(&mut container, &plan, report);

        report.record_container(ContainerReport {
            name: output_name,
            path: path.to_path_buf(),
            format: Some(container.format()),
            status: ContainerStatus::Processed,
            staged: staged.len(),
            skipped: plan.skipped.clone(),
        });

        for nested in &plan.nested {
            if self.guard.is_cancelled() {
                break;
            }
            self.process_nested(&mut container, nested, report)?;
        }
        Ok(())
    }

    /// Unpack an ISO held in a ZIP into a scratch directory and process it
    /// as a container of its own.
    fn process_nested(
        &mut self,
        outer: &mut Container,
        nested: &NestedContainer,
        report: &mut RunReport,
    ) -> Result<()> {
        let scratch = self
            .guard
            .create_scratch_dir(&self.config.output_dir, "nested")
            .with_context(|| {
                format!(
                    "creating scratch directory in '{}'",
                    self.config.output_dir.display()
                )
            })?;
        let path = scratch.path().join(nested.member.file_name());
        info!("unpacking {} from {}", nested.member, outer.name());

        let unpacked = outer.open_member(nested.member_index).and_then(|mut reader| {
            let mut file = io::BufWriter::with_capacity(COPY_BUFFER, File::create(&path)?);
            io::copy(&mut reader, &mut file)?;
            file.flush()
        });
        if let Err(err) = unpacked {
            warn!("could not unpack {}: {err}", nested.member);
            report.record_container(skipped_container(&path, Error::corrupt(&path, err)));
            return Ok(());
        }

        self.process_container(&path, report)
    }

    fn build(&self, report: &mut RunReport) -> Result<()> {
        let orchestrator = BuildOrchestrator::new(&self.config.build, self.guard);
        let plan = orchestrator.plan(report, &self.config.builders, &self.config.checkout.dir);

        for (platform, reason) in &plan.skipped {
            info!("{platform}: build skipped ({reason})");
            report.record_build(*platform, BuildOutcome::Skipped { reason: *reason });
        }
        if plan.targets.is_empty() {
            return Ok(());
        }
        if let Err(err) = preflight::check_build_tools(&self.config.build.command) {
            warn!("{err}");
        }

        for (platform, outcome) in orchestrator.run(&plan.targets)? {
            report.record_build(platform, outcome);
        }
        Ok(())
    }
}

fn skipped_container(path: &Path, err: Error) -> ContainerReport {
    let status = match &err {
        Error::UnsupportedFormat { .. } => ContainerStatus::UnsupportedFormat {
            reason: err.to_string(),
        },
        Error::CorruptArchive { reason, .. } => ContainerStatus::CorruptArchive {
            reason: reason.clone(),
        },
        other => ContainerStatus::CorruptArchive {
            reason: other.to_string(),
        },
    };
    ContainerReport {
        name: container_name(path),
        path: path.to_path_buf(),
        format: ContainerFormat::from_extension(path),
        status,
        staged: 0,
        skipped: Vec::new(),
    }
}

/// `.zip` and `.iso` files directly under `source`, in file-name order.
pub fn discover_containers(source: &Path) -> Result<Vec<PathBuf>> {
    if !source.is_dir() {
        anyhow::bail!("source directory '{}' does not exist", source.display());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(source)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry =
            entry.with_context(|| format!("listing source directory '{}'", source.display()))?;
        if entry.file_type().is_file() && ContainerFormat::from_extension(entry.path()).is_some() {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}
