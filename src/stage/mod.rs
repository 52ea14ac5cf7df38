//! Materializing an extraction plan on disk.
//!
//! Every image is streamed to `<dest>.partial`, hashed on the way, and
//! renamed into place. An existing destination with the same size and digest
//! is left untouched, so reruns produce a byte-identical tree. Build-relevant
//! images are then hardlinked into their builder directory; images of
//! platforms without a builder go to `<output>/generic_vms/` under the name a
//! generic VM import expects.

pub mod vswitch;

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive::{Container, ContainerFormat, MemberPath};
use crate::build::BuilderMap;
use crate::classify::{Platform, PlatformIdentity};
use crate::error::Error;
use crate::fsutil::{self, COPY_BUFFER};
use crate::plan::{container_dir, ExtractionPlan, ExtractionTask};
use crate::report::RunReport;

/// Name of the per-container manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Output subdirectory for images of platforms without a vrnetlab builder.
pub const GENERIC_VMS_DIR: &str = "generic_vms";

/// One image that reached its destination.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub member: MemberPath,
    pub identity: PlatformIdentity,
    pub destination: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub build_file: String,
    /// Copy inside the builder directory, when one was made.
    pub build_path: Option<PathBuf>,
    /// Copy under [`GENERIC_VMS_DIR`] for platforms without a builder.
    pub generic_path: Option<PathBuf>,
}

pub struct StagingExecutor<'a> {
    output_root: &'a Path,
    checkout: &'a Path,
    builders: &'a BuilderMap,
}

impl<'a> StagingExecutor<'a> {
    pub fn new(output_root: &'a Path, checkout: &'a Path, builders: &'a BuilderMap) -> Self {
        Self {
            output_root,
            checkout,
            builders,
        }
    }

    /// Stage every task of `plan`, recording results and failures in
    /// `report`. Returns the images that were staged.
    pub fn execute(
        &self,
        container: &mut Container,
        plan: &ExtractionPlan,
        report: &mut RunReport,
    ) -> Vec<StagedImage> {
        report.record_plan(plan);

        let mut staged = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            match self.stage_task(container, task) {
                Ok(image) => {
                    report.record_staged(&image);
                    staged.push(image);
                }
                Err(err) => {
                    warn!("{}: {err}", task.identity.platform);
                    report.record_failure(task.identity.platform, err.to_string());
                }
            }
        }

        if staged.is_empty() {
            return staged;
        }
        if let Err(err) = self.write_manifest(&plan.container, container.format(), &staged) {
            warn!("{}: could not write manifest: {err:#}", plan.container);
        }
        if staged.iter().any(|s| s.identity.platform == Platform::Cat9kv) {
            self.stage_vswitch(container, &plan.container, report);
        }
        info!("{}: staged {} image(s)", plan.container, staged.len());
        staged
    }

    fn stage_task(
        &self,
        container: &mut Container,
        task: &ExtractionTask,
    ) -> Result<StagedImage, Error> {
        let failed = |destination: &Path, source: io::Error| Error::StagingIo {
            member: task.member.to_string(),
            destination: destination.to_path_buf(),
            source,
        };

        let (sha256, size) = copy_member(container, task).map_err(|e| failed(&task.destination, e))?;
        debug!(
            "{} -> {} ({size} bytes, sha256 {sha256})",
            task.member,
            task.destination.display()
        );

        let build_path = match self.builder_dir(task) {
            Some(dir) => {
                let target = dir.join(&task.build_file);
                fsutil::hardlink_or_copy(&task.destination, &target).map_err(|e| failed(&target, e))?;
                Some(target)
            }
            None => None,
        };

        let generic_path = if self.builders.dir_for(task.identity.platform).is_none() {
            let target = self.output_root.join(GENERIC_VMS_DIR).join(&task.build_file);
            self.stage_generic_vm(task, &sha256, &target)
                .map_err(|e| failed(&target, e))?;
            Some(target)
        } else {
            None
        };

        Ok(StagedImage {
            member: task.member.clone(),
            identity: task.identity.clone(),
            destination: task.destination.clone(),
            size,
            sha256,
            build_file: task.build_file.clone(),
            build_path,
            generic_path,
        })
    }

    fn stage_generic_vm(
        &self,
        task: &ExtractionTask,
        sha256: &str,
        target: &Path,
    ) -> io::Result<()> {
        if fsutil::same_file(&task.destination, target) {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_file() {
            let (existing, _) = fsutil::sha256_file(target)?;
            if existing != sha256 {
                warn!(
                    "{} replaces a different image at {}",
                    task.member,
                    target.display()
                );
            }
        }
        fsutil::hardlink_or_copy(&task.destination, target)?;
        debug!("{} -> {}", task.member, target.display());
        Ok(())
    }

    /// Existing builder directory for a build-relevant task.
    fn builder_dir(&self, task: &ExtractionTask) -> Option<PathBuf> {
        if !task.build_relevant {
            return None;
        }
        let dir = self.checkout.join(self.builders.dir_for(task.identity.platform)?);
        if dir.is_dir() {
            Some(dir)
        } else {
            debug!(
                "{}: builder directory {} does not exist",
                task.identity.platform,
                dir.display()
            );
            None
        }
    }

    fn write_manifest(
        &self,
        container: &str,
        format: ContainerFormat,
        staged: &[StagedImage],
    ) -> anyhow::Result<()> {
        let mut images: Vec<ManifestImage<'_>> = staged
            .iter()
            .map(|image| ManifestImage {
                member: &image.member,
                platform: image.identity.platform,
                version: &image.identity.version,
                variant: image.identity.variant.as_deref(),
                destination: self.relative(&image.destination),
                size: image.size,
                sha256: &image.sha256,
                build_file: &image.build_file,
                generic_vm: image
                    .generic_path
                    .as_deref()
                    .map(|path| self.relative(path)),
            })
            .collect();
        images.sort_by(|a, b| a.destination.cmp(&b.destination));

        let manifest = ContainerManifest {
            container,
            format,
            images,
        };
        fsutil::write_json_atomic(
            &container_dir(self.output_root, container).join(MANIFEST_FILE),
            &manifest,
        )
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.output_root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn stage_vswitch(&self, container: &mut Container, name: &str, report: &mut RunReport) {
        let Some(index) = container
            .entries()
            .iter()
            .find(|e| e.path().folded_file_name() == vswitch::NODE_DEFINITION)
            .map(|e| e.index())
        else {
            debug!("{name}: no {} in container", vswitch::NODE_DEFINITION);
            return;
        };

        let mut yaml = String::new();
        let read = container
            .open_member(index)
            .and_then(|mut reader| reader.read_to_string(&mut yaml));
        if let Err(err) = read {
            warn!("{name}: reading {}: {err}", vswitch::NODE_DEFINITION);
            return;
        }
        let Some(xml) = vswitch::extract_vswitch_xml(&yaml) else {
            warn!("{name}: no vswitch.xml block in {}", vswitch::NODE_DEFINITION);
            return;
        };

        let output = container_dir(self.output_root, name)
            .join(Platform::Cat9kv.slug())
            .join(vswitch::VSWITCH_FILE);
        if let Err(err) = fs::write(&output, &xml) {
            warn!("writing {}: {err}", output.display());
            return;
        }

        let builder = self
            .builders
            .dir_for(Platform::Cat9kv)
            .map(|dir| self.checkout.join(dir))
            .filter(|dir| dir.is_dir() && !self.builders.is_skipped(Platform::Cat9kv));
        if let Some(dir) = builder {
            let target = dir.join(vswitch::VSWITCH_FILE);
            match fs::write(&target, &xml) {
                Ok(()) => report.record_build_extra(Platform::Cat9kv, &target),
                Err(err) => warn!("writing {}: {err}", target.display()),
            }
        }
    }
}

#[derive(Serialize)]
struct ContainerManifest<'a> {
    container: &'a str,
    format: ContainerFormat,
    images: Vec<ManifestImage<'a>>,
}

#[derive(Serialize)]
struct ManifestImage<'a> {
    member: &'a MemberPath,
    platform: Platform,
    version: &'a str,
    variant: Option<&'a str>,
    destination: String,
    size: u64,
    sha256: &'a str,
    build_file: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    generic_vm: Option<String>,
}

/// Copy one member to its destination through a `.partial` file.
fn copy_member(container: &mut Container, task: &ExtractionTask) -> io::Result<(String, u64)> {
    if let Some(parent) = task.destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(&task.destination);

    let copied = container
        .open_member(task.member_index)
        .and_then(|mut reader| write_hashed(&mut reader, &partial));
    let (sha256, size) = match copied {
        Ok(done) => done,
        Err(err) => {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
    };
    if size != task.size {
        let _ = fs::remove_file(&partial);
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("member ended after {size} of {} bytes", task.size),
        ));
    }

    let unchanged = task.destination.is_file()
        && fsutil::sha256_file(&task.destination)
            .map(|existing| existing == (sha256.clone(), size))
            .unwrap_or(false);
    if unchanged {
        debug!("{} unchanged", task.destination.display());
        fs::remove_file(&partial)?;
    } else {
        fsutil::atomic_rename(&partial, &task.destination)?;
    }
    Ok((sha256, size))
}

fn write_hashed(reader: &mut dyn Read, path: &Path) -> io::Result<(String, u64)> {
    let mut out = BufWriter::new(File::create(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        size += n as u64;
    }
    let file = out.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
