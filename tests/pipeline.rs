use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use refplat_builder::build::BuilderMap;
use refplat_builder::config::{BuildSettings, CheckoutSettings, DEFAULT_REPO_URL};
use refplat_builder::report::ContainerStatus;
use refplat_builder::{pipeline, BuildOutcome, LifecycleGuard, Platform, RunConfig};
use tempfile::TempDir;
use walkdir::WalkDir;

const CSR_IMAGE: &[u8] = b"csr1000v qcow2 image bytes";
const IOL_IMAGE: &[u8] = b"iol l2 binary";

/// Plain ISO 9660 (level 2, no Rock Ridge or Joliet) holding
/// `VIRL_BASE_IMAGES/IOL_XE_17_16_01A/X86_64_CRB_LINUX_L2_ADV.IOL;1` and
/// `NODE_DEFINITIONS/IOL_L2.YAML;1`.
const ISO_FIXTURE: &str = "tests/fixtures/refplat-20250101-iol.iso";
const ISO_IOL_IMAGE: &[u8] = b"iol l2 image from an iso\n";

/// Build command standing in for `make docker-image`: fails where a
/// `fail-marker` file exists, otherwise prints a docker tag line.
const FAKE_MAKE: &str = r##"if [ -f fail-marker ]; then echo "make: *** [docker-image] Error 3" >&2; exit 3; fi
echo "#8 naming to docker.io/vrnetlab/cisco_$(basename "$(pwd -P)"):test done""##;

struct Workspace {
    _tmp: TempDir,
    source: PathBuf,
    output: PathBuf,
    checkout: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = tempfile::Builder::new()
            .prefix("refplat-builder-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let source = tmp.path().join("refplats");
        let output = tmp.path().join("refplat-images");
        let checkout = tmp.path().join("vrnetlab");
        fs::create_dir_all(&source).unwrap();

        for platform in ["csr1000v", "iol"] {
            let dir = checkout.join("cisco").join(platform);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("Makefile"), "docker-image:\n\ttrue\n").unwrap();
        }
        fs::write(checkout.join("cisco/iol/fail-marker"), b"").unwrap();

        Self {
            _tmp: tmp,
            source,
            output,
            checkout,
        }
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            source_dir: self.source.clone(),
            output_dir: self.output.clone(),
            checkout: CheckoutSettings {
                repo_url: DEFAULT_REPO_URL.to_string(),
                dir: self.checkout.clone(),
                update: false,
            },
            build: BuildSettings {
                command: vec!["sh".to_string(), "-c".to_string(), FAKE_MAKE.to_string()],
                jobs: 2,
                grace_period: Duration::from_secs(1),
            },
            builders: BuilderMap::default(),
            rules: Vec::new(),
        }
    }

    fn write_zip(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = self.source.join(name);
        let file = fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (member, content) in files {
            writer.start_file(member.to_string(), options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn write_refplat(&self) {
        self.write_zip(
            "refplat-20240623-fcs.zip",
            &[
                (
                    "virl-base-images/csr1000v-170308/csr1000v-universalk9.17.03.08-serial.qcow2",
                    CSR_IMAGE,
                ),
                ("virl-base-images/iol-l2-xe-171601/iol-L2-XE_17_16_01A.bin", IOL_IMAGE),
                ("node-definitions/README.txt", b"not an image"),
            ],
        );
        fs::write(
            self.source.join("refplat-20240623-fcs-broken.iso"),
            b"this is not an ISO 9660 image",
        )
        .unwrap();
    }
}

fn run(workspace: &Workspace) -> refplat_builder::RunReport {
    let guard = LifecycleGuard::new();
    let report = pipeline::run(&workspace.config(), &guard).expect("run should complete");
    assert!(guard.registered_dirs().is_empty());
    report
}

fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

fn scratch_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".refplat-"))
        .map(|e| e.into_path())
        .collect()
}

#[test]
fn test_corrupt_iso_is_skipped_and_zip_is_fully_processed() {
    let workspace = Workspace::new();
    workspace.write_refplat();

    let report = run(&workspace);

    let broken = report
        .container("refplat-20240623-fcs-broken")
        .expect("corrupt ISO is reported");
    assert!(matches!(broken.status, ContainerStatus::CorruptArchive { .. }));

    let zip = report.container("refplat-20240623-fcs").unwrap();
    assert_eq!(zip.status, ContainerStatus::Processed);
    assert_eq!(zip.staged, 2);
    assert_eq!(zip.skipped.len(), 1);

    let csr = workspace
        .output
        .join("refplat-20240623-fcs/csr1000v/csr1000v-17.03.08.qcow2");
    assert_eq!(fs::read(&csr).unwrap(), CSR_IMAGE);
    assert!(workspace
        .output
        .join("refplat-20240623-fcs/manifest.json")
        .is_file());

    let csr_report = report.platform(Platform::Csr1000v).unwrap();
    assert_eq!(csr_report.staged, 1);
    assert!(csr_report.versions.contains("17.03.08"));

    let iol_report = report.platform(Platform::Iol).unwrap();
    assert!(iol_report.versions.contains("XE_17_16_01A"));
}

#[test]
fn test_failing_build_does_not_stop_other_platforms() {
    let workspace = Workspace::new();
    workspace.write_refplat();

    let report = run(&workspace);

    match &report.platform(Platform::Iol).unwrap().outcome {
        BuildOutcome::Failed {
            exit_code, output, ..
        } => {
            assert_eq!(*exit_code, Some(3));
            assert!(output.contains("Error 3"));
        }
        other => panic!("expected IOL build failure, got {other}"),
    }
    match &report.platform(Platform::Csr1000v).unwrap().outcome {
        BuildOutcome::Succeeded { images } => {
            assert_eq!(images, &vec!["vrnetlab/cisco_csr1000v:test".to_string()]);
        }
        other => panic!("expected CSR build success, got {other}"),
    }

    // Successful builds consume their staged files; failed ones keep them.
    assert!(!workspace
        .checkout
        .join("cisco/csr1000v/csr1000v-universalk9.17.03.08-serial.qcow2")
        .exists());
    assert_eq!(
        fs::read(workspace.checkout.join("cisco/iol/cisco_iol-L2-XE_17_16_01A.bin")).unwrap(),
        IOL_IMAGE
    );
    assert!(report.has_failures());
    assert!(report.summary().contains("vrnetlab/cisco_csr1000v:test"));
}

#[test]
fn test_reruns_produce_an_identical_output_tree() {
    let workspace = Workspace::new();
    workspace.write_refplat();

    run(&workspace);
    let first = tree(&workspace.output);
    run(&workspace);
    let second = tree(&workspace.output);

    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert!(!first.keys().any(|p| p.to_string_lossy().ends_with(".partial")));
    assert!(first.contains_key(Path::new(".refplat-builder.lock")));
}

#[test]
fn test_iso_inside_zip_is_processed_as_its_own_container() {
    let workspace = Workspace::new();
    workspace.write_zip(
        "refplat-20241016-supplemental.zip",
        &[
            ("iso/refplat-20241016-extra.iso", b"truncated"),
            ("csr1000v-universalk9.17.03.08-serial.qcow2", CSR_IMAGE),
        ],
    );

    let report = run(&workspace);

    let outer = report.container("refplat-20241016-supplemental").unwrap();
    assert_eq!(outer.status, ContainerStatus::Processed);
    assert_eq!(outer.staged, 1);

    let nested = report
        .container("refplat-20241016-extra")
        .expect("nested ISO is reported under its own name");
    assert!(matches!(nested.status, ContainerStatus::CorruptArchive { .. }));
    assert!(scratch_dirs(&workspace.output).is_empty());
}

#[test]
fn test_report_is_written_as_json() {
    let workspace = Workspace::new();
    workspace.write_refplat();

    let report = run(&workspace);
    let path = workspace.output.join("report.json");
    report.write_json(&path).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(value["platforms"]["csr1000v"]["outcome"]["status"], "succeeded");
    assert_eq!(value["platforms"]["iol"]["outcome"]["status"], "failed");
}

#[test]
fn test_terminate_removes_every_scratch_directory() {
    let workspace = Workspace::new();
    fs::create_dir_all(&workspace.output).unwrap();
    let guard = LifecycleGuard::new();

    let kept = guard.create_scratch_dir(&workspace.output, "nested").unwrap();
    fs::write(kept.path().join("partial.iso"), b"half written").unwrap();
    let other = guard.create_scratch_dir(&workspace.output, "nested").unwrap();
    std::mem::forget(other);

    assert_eq!(scratch_dirs(&workspace.output).len(), 2);
    assert_eq!(guard.terminate(), 2);
    assert!(scratch_dirs(&workspace.output).is_empty());
    assert!(guard.is_cancelled());

    // A cancelled guard stops the next run before any container is touched.
    workspace.write_refplat();
    assert!(pipeline::run(&workspace.config(), &guard).is_ok());
    assert!(!workspace.output.join("refplat-20240623-fcs").exists());
    drop(kept);
}

fn iso_fixture() -> Vec<u8> {
    fs::read(Path::new(env!("CARGO_MANIFEST_DIR")).join(ISO_FIXTURE)).unwrap()
}

#[test]
fn test_iso_container_is_walked_classified_and_staged() {
    let workspace = Workspace::new();
    fs::write(workspace.source.join("refplat-20250101-iol.iso"), iso_fixture()).unwrap();

    let report = run(&workspace);

    let iso = report.container("refplat-20250101-iol").unwrap();
    assert_eq!(iso.status, ContainerStatus::Processed);
    assert_eq!(iso.staged, 1);
    assert_eq!(iso.skipped.len(), 1);
    assert_eq!(iso.skipped[0].member.as_str(), "NODE_DEFINITIONS/IOL_L2.YAML");

    let staged = workspace
        .output
        .join("refplat-20250101-iol/iol/iol-L2-XE_17_16_01A.iol");
    assert_eq!(fs::read(staged).unwrap(), ISO_IOL_IMAGE);
    assert_eq!(
        fs::read(workspace.checkout.join("cisco/iol/cisco_iol-L2-XE_17_16_01A.bin")).unwrap(),
        ISO_IOL_IMAGE
    );
    let iol = report.platform(Platform::Iol).unwrap();
    assert!(iol.versions.contains("XE_17_16_01A"));
}

#[test]
fn test_valid_iso_inside_zip_is_staged_into_its_own_directory() {
    let workspace = Workspace::new();
    let iso = iso_fixture();
    workspace.write_zip(
        "refplat-20250101-iol.zip",
        &[
            ("refplat-20250101-iol.iso", &iso),
            ("csr1000v-universalk9.17.03.08-serial.qcow2", CSR_IMAGE),
        ],
    );

    let report = run(&workspace);

    let outer = report.container("refplat-20250101-iol").unwrap();
    assert_eq!(outer.staged, 1);
    let nested = report
        .container("refplat-20250101-iol-iso")
        .expect("nested ISO gets a directory apart from its ZIP");
    assert_eq!(nested.status, ContainerStatus::Processed);
    assert_eq!(nested.staged, 1);

    assert_eq!(
        fs::read(workspace.output.join("refplat-20250101-iol-iso/iol/iol-L2-XE_17_16_01A.iol"))
            .unwrap(),
        ISO_IOL_IMAGE
    );
    assert_eq!(
        fs::read(workspace.output.join("refplat-20250101-iol/csr1000v/csr1000v-17.03.08.qcow2"))
            .unwrap(),
        CSR_IMAGE
    );
    assert!(scratch_dirs(&workspace.output).is_empty());
}

#[test]
fn test_containers_sharing_a_base_name_do_not_overwrite_each_other() {
    let workspace = Workspace::new();
    workspace.write_zip(
        "refplat-x.ZIP",
        &[
            ("csr1000v-universalk9.17.03.08-serial.qcow2", b"SECOND-DIFFERENT"),
            ("iol-L2-XE_17_16_01A.bin", IOL_IMAGE),
        ],
    );
    workspace.write_zip(
        "refplat-x.zip",
        &[("csr1000v-universalk9.17.03.08-serial.qcow2", b"FIRST")],
    );

    let report = run(&workspace);

    let names: Vec<(&str, usize)> = report
        .containers()
        .iter()
        .map(|c| (c.name.as_str(), c.staged))
        .collect();
    assert_eq!(names, vec![("refplat-x", 2), ("refplat-x-zip", 1)]);

    let csr = "csr1000v/csr1000v-17.03.08.qcow2";
    assert_eq!(
        fs::read(workspace.output.join("refplat-x").join(csr)).unwrap(),
        b"SECOND-DIFFERENT"
    );
    assert_eq!(
        fs::read(workspace.output.join("refplat-x-zip").join(csr)).unwrap(),
        b"FIRST"
    );

    let manifest = |dir: &str| -> serde_json::Value {
        serde_json::from_slice(&fs::read(workspace.output.join(dir).join("manifest.json")).unwrap())
            .unwrap()
    };
    assert_eq!(manifest("refplat-x")["images"].as_array().unwrap().len(), 2);
    assert_eq!(manifest("refplat-x-zip")["images"].as_array().unwrap().len(), 1);
    assert_eq!(report.platform(Platform::Csr1000v).unwrap().staged, 2);
}
