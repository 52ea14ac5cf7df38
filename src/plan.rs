//! Turning classified members into extraction tasks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{Container, ContainerFormat, MemberEntry, MemberPath};
use crate::build::BuilderMap;
use crate::classify::{version, ClassificationResult, Classifier, PlatformIdentity};

/// Copy one classified member to its destination.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub container: String,
    pub member_index: usize,
    pub member: MemberPath,
    pub size: u64,
    pub identity: PlatformIdentity,
    pub destination: PathBuf,
    /// File name inside the platform's build directory.
    pub build_file: String,
    pub build_relevant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Unclassified,
    Ambiguous { candidates: Vec<PlatformIdentity> },
    Superseded { by: MemberPath },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub member: MemberPath,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// A ZIP member that is itself an ISO container.
#[derive(Debug, Clone)]
pub struct NestedContainer {
    pub member_index: usize,
    pub member: MemberPath,
}

#[derive(Debug, Clone)]
pub struct ExtractionPlan {
    pub container: String,
    pub tasks: Vec<ExtractionTask>,
    pub skipped: Vec<SkippedEntry>,
    pub nested: Vec<NestedContainer>,
}

pub struct ExtractionPlanner<'a> {
    classifier: &'a Classifier,
    builders: &'a BuilderMap,
    output_root: &'a Path,
}

impl<'a> ExtractionPlanner<'a> {
    pub fn new(classifier: &'a Classifier, builders: &'a BuilderMap, output_root: &'a Path) -> Self {
        Self {
            classifier,
            builders,
            output_root,
        }
    }

    /// Plan `container` into the output directory `output_name`, as handed
    /// out by [`OutputNames::claim`].
    pub fn plan_container(&self, container: &Container, output_name: &str) -> ExtractionPlan {
        self.plan(
            output_name,
            container.name(),
            container.format(),
            container.entries(),
        )
    }

    /// Plan one container's entries in traversal order.
    ///
    /// `container` names the output directory; the fallback version comes
    /// from `source_name`, the container's own base name. On a destination
    /// collision the later entry replaces the earlier one, which is recorded
    /// as superseded.
    pub fn plan(
        &self,
        container: &str,
        source_name: &str,
        format: ContainerFormat,
        entries: &[MemberEntry],
    ) -> ExtractionPlan {
        let fallback = version::container_version(source_name);
        let mut plan = ExtractionPlan {
            container: container.to_string(),
            tasks: Vec::new(),
            skipped: Vec::new(),
            nested: Vec::new(),
        };
        // Keyed on the case-folded destination.
        let mut by_destination: HashMap<String, usize> = HashMap::new();

        for entry in entries {
            let member = entry.path();
            if format == ContainerFormat::Zip && member.extension() == Some("iso") {
                plan.nested.push(NestedContainer {
                    member_index: entry.index(),
                    member: member.clone(),
                });
                continue;
            }

            let found = match self.classifier.classify(member, &fallback) {
                ClassificationResult::Matched(found) => found,
                ClassificationResult::Unrecognized => {
                    debug!(container, %member, "unclassified");
                    plan.skip(member, SkipReason::Unclassified);
                    continue;
                }
                ClassificationResult::Ambiguous(candidates) => {
                    debug!(container, %member, candidates = candidates.len(), "ambiguous");
                    plan.skip(member, SkipReason::Ambiguous { candidates });
                    continue;
                }
            };
            debug!(container, %member, identity = %found.identity, rule = %found.rule, "classified");

            if entry.size() == 0 {
                plan.skip(member, SkipReason::Empty);
                continue;
            }

            let destination = destination_for(
                self.output_root,
                container,
                &found.identity,
                member.extension(),
            );
            let task = ExtractionTask {
                container: container.to_string(),
                member_index: entry.index(),
                member: member.clone(),
                size: entry.size(),
                build_relevant: self.builders.is_build_relevant(found.identity.platform),
                identity: found.identity,
                destination: destination.clone(),
                build_file: found.build_file,
            };

            let key = destination.to_string_lossy().to_ascii_lowercase();
            match by_destination.get(&key) {
                Some(&position) => {
                    let earlier = std::mem::replace(&mut plan.tasks[position], task);
                    info!(
                        container,
                        superseded = %earlier.member,
                        by = %member,
                        "later entry replaces earlier one for {}",
                        destination.display()
                    );
                    plan.skip(
                        &earlier.member,
                        SkipReason::Superseded { by: member.clone() },
                    );
                }
                None => {
                    by_destination.insert(key, plan.tasks.len());
                    plan.tasks.push(task);
                }
            }
        }

        plan
    }
}

impl ExtractionPlan {
    fn skip(&mut self, member: &MemberPath, reason: SkipReason) {
        self.skipped.push(SkippedEntry {
            member: member.clone(),
            reason,
        });
    }
}

/// `<output>/<container>/<slug>/<slug>[-<variant>]-<version>.<ext>`
pub fn destination_for(
    output_root: &Path,
    container: &str,
    identity: &PlatformIdentity,
    extension: Option<&str>,
) -> PathBuf {
    let slug = identity.platform.slug();
    let mut file_name = slug.to_string();
    if let Some(variant) = &identity.variant {
        file_name.push('-');
        file_name.push_str(&sanitize_segment(variant));
    }
    file_name.push('-');
    file_name.push_str(&sanitize_segment(&identity.version));
    if let Some(ext) = extension {
        file_name.push('.');
        file_name.push_str(ext);
    }

    container_dir(output_root, container)
        .join(slug)
        .join(file_name)
}

/// Output directory names handed out during one run.
///
/// Containers sharing a base name (`x.zip` next to `x.iso`, or an ISO nested
/// in a ZIP of the same name) each get a directory of their own. Names are
/// compared case-insensitively.
#[derive(Debug, Default)]
pub struct OutputNames {
    taken: HashSet<String>,
}

impl OutputNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sanitized base name if still free, else `<name>-<format>`, then
    /// `<name>-<format>-2`, `-3`, ...
    pub fn claim(&mut self, name: &str, format: ContainerFormat) -> String {
        let base = sanitize_segment(name);
        let mut candidate = base.clone();
        let mut attempt = 1;
        while self.taken.contains(&candidate.to_ascii_lowercase()) {
            candidate = match attempt {
                1 => format!("{base}-{}", format.as_str()),
                n => format!("{base}-{}-{n}", format.as_str()),
            };
            attempt += 1;
        }
        self.taken.insert(candidate.to_ascii_lowercase());
        candidate
    }
}

/// Output subdirectory of one container.
pub fn container_dir(output_root: &Path, container: &str) -> PathBuf {
    output_root.join(sanitize_segment(container))
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
