use regex::Regex;
use serde::Deserialize;

use super::version::parent_dir_version;
use super::{ImageMatch, Platform, PlatformIdentity};
use crate::archive::MemberPath;

/// Where a rule reads the version from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    /// One capture group of the file-name pattern.
    Capture(usize),
    /// Several capture groups joined by a separator.
    Join { groups: Vec<usize>, separator: String },
    /// The parent directory name minus its first `_` token.
    ParentDir,
}

/// Rewrites the version before it is substituted into a build file name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionTransform {
    #[default]
    Verbatim,
    /// `_` becomes `.`
    Dotted,
    /// `_` becomes `.`, then lowercase.
    DottedLower,
    /// `.` becomes `-`
    Dashed,
}

impl VersionTransform {
    pub fn apply(self, version: &str) -> String {
        match self {
            Self::Verbatim => version.to_string(),
            Self::Dotted => version.replace('_', "."),
            Self::DottedLower => version.replace('_', ".").to_lowercase(),
            Self::Dashed => version.replace('.', "-"),
        }
    }
}

/// One entry of the ordered classification table.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    pattern: Regex,
    platform: Platform,
    variant: Option<String>,
    version: VersionSource,
    build_file: String,
    transform: VersionTransform,
}

impl Rule {
    /// A rule matching the case-folded file name against `pattern`.
    ///
    /// Defaults: first capture group as version, build file named after the
    /// platform slug.
    pub fn new(name: &str, pattern: &str, platform: Platform) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
            platform,
            variant: None,
            version: VersionSource::Capture(1),
            build_file: format!("{}-{{version}}", platform.slug()),
            transform: VersionTransform::Verbatim,
        })
    }

    pub fn variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    pub fn version(mut self, source: VersionSource) -> Self {
        self.version = source;
        self
    }

    pub fn build_file(mut self, template: &str) -> Self {
        self.build_file = template.to_string();
        self
    }

    pub fn transform(mut self, transform: VersionTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Match `path` against this rule.
    ///
    /// The pattern runs on the folded file name; captures are sliced from
    /// the original-case name at the same offsets.
    pub(crate) fn evaluate(&self, path: &MemberPath, fallback_version: &str) -> Option<ImageMatch> {
        let folded = path.folded_file_name();
        let original = path.file_name();
        let caps = self.pattern.captures(folded)?;

        let version = match &self.version {
            VersionSource::Capture(group) => original.get(caps.get(*group)?.range())?.to_string(),
            VersionSource::Join { groups, separator } => {
                let mut parts = Vec::with_capacity(groups.len());
                for group in groups {
                    parts.push(original.get(caps.get(*group)?.range())?);
                }
                parts.join(separator)
            }
            VersionSource::ParentDir => path
                .parent_name()
                .and_then(parent_dir_version)
                .unwrap_or(fallback_version)
                .to_string(),
        };
        if version.is_empty() {
            return None;
        }

        let build_file = self
            .build_file
            .replace("{version}", &self.transform.apply(&version));
        Some(ImageMatch {
            identity: PlatformIdentity {
                platform: self.platform,
                version,
                variant: self.variant.clone(),
            },
            rule: self.name.clone(),
            build_file,
        })
    }
}

/// A rule as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    pub platform: Platform,
    pub variant: Option<String>,
    pub version: VersionSource,
    pub build_file: String,
    pub transform: Option<VersionTransform>,
}

impl RuleSpec {
    pub fn compile(&self) -> Result<Rule, regex::Error> {
        let mut rule = Rule::new(&self.name, &self.pattern, self.platform)?
            .version(self.version.clone())
            .build_file(&self.build_file)
            .transform(self.transform.unwrap_or_default());
        if let Some(variant) = &self.variant {
            rule = rule.variant(variant);
        }
        Ok(rule)
    }
}

/// The built-in table in priority order.
///
/// Renamed vrnetlab-style names come before raw refplat names, L2 markers
/// before their general counterparts.
pub fn builtin_rules() -> Vec<Rule> {
    use Platform::*;
    use VersionSource::{Capture, ParentDir};
    use VersionTransform::{Dashed, Dotted, DottedLower};

    let dotted_join = || VersionSource::Join {
        groups: vec![1, 2, 3],
        separator: ".".to_string(),
    };

    // Invalid literal patterns are logged and dropped.
    let table: Vec<Result<Rule, regex::Error>> = vec![
        Rule::new("asav", r"^asav(\d+)_(\d+)_(\d+)\.qcow2$", Asav).map(|r| {
            r.version(dotted_join())
                .build_file("asav{version}.qcow2")
                .transform(Dashed)
        }),
        Rule::new("cat9kv", r"^cat9kv.*\.qcow2$", Cat9kv)
            .map(|r| r.version(ParentDir).build_file("cat9kv_prd-{version}.qcow2")),
        Rule::new("n9kv", r"^nexus9300v.*\.qcow2$", N9kv)
            .map(|r| r.version(ParentDir).build_file("n9kv-{version}.qcow2")),
        Rule::new("xrv9k", r"^xrv9k_fullk9_x_(\d+)_(\d+)_(\d+)\.qcow2$", Xrv9k)
            .map(|r| r.version(dotted_join()).build_file("xrv9k-fullk9-x-{version}.qcow2")),
        Rule::new(
            "csr1000v-serial",
            r"^csr1000v-universalk9\.(.+)-serial\.qcow2$",
            Csr1000v,
        )
        .map(|r| {
            r.version(Capture(1))
                .build_file("csr1000v-universalk9.{version}-serial.qcow2")
        }),
        Rule::new("csr1000v", r"^csr1000v.*\.qcow2$", Csr1000v).map(|r| {
            r.version(ParentDir)
                .build_file("csr1000v-universalk9.{version}-serial.qcow2")
        }),
        Rule::new("c8000v", r"^c8000v_universalk9.*\.qco(w2)?$", C8000v).map(|r| {
            r.version(ParentDir)
                .build_file("c8000v-{version}.qcow2")
                .transform(DottedLower)
        }),
        Rule::new("iol-l2-renamed", r"^(?:cisco_)?iol-l2-(.+)\.bin$", Iol).map(|r| {
            r.variant("L2")
                .version(Capture(1))
                .build_file("cisco_iol-L2-{version}.bin")
        }),
        Rule::new("iol-renamed", r"^(?:cisco_)?iol-(.+)\.bin$", Iol)
            .map(|r| r.version(Capture(1)).build_file("cisco_iol-{version}.bin")),
        Rule::new("iol-l2", r"^x86_64_crb_linux_l2.*\.iol$", Iol).map(|r| {
            r.variant("L2")
                .version(ParentDir)
                .build_file("cisco_iol-L2-{version}.bin")
        }),
        Rule::new("iol", r"^x86_64_crb_linux_adventerpr.*\.iol$", Iol)
            .map(|r| r.version(ParentDir).build_file("cisco_iol-{version}.bin")),
        Rule::new("ise", r"^cisco_vise.*\.qcow2$", Ise)
            .map(|r| r.version(ParentDir).build_file("cisco-ise-{version}.qcow2")),
        Rule::new("viosl2", r"^vios_l2_adventerprisek9_m_s.*\.qco(w2)?$", Viosl2)
            .map(|r| r.version(ParentDir).build_file("cisco_viosl2-{version}.qcow2")),
        Rule::new("vios", r"^vios_adventerprisek9_m_spa.*\.qco(w2)?$", Vios)
            .map(|r| r.version(ParentDir).build_file("cisco_vios-{version}.qcow2")),
        Rule::new("ftdv", r"^cisco_secure_firewall_threa.*\.qco(w2)?$", Ftdv).map(|r| {
            r.version(ParentDir)
                .build_file("Cisco_Secure_Firewall_Threat_Defense_Virtual-{version}-1.qcow2")
                .transform(Dotted)
        }),
        Rule::new("fmc", r"^cisco_secure_fw_mgmt_center.*\.qco(w2)?$", Fmc)
            .map(|r| r.version(ParentDir).build_file("cisco_fmc-{version}.qcow2")),
        Rule::new("c9800cl", r"^c9800_cl_universalk9.*\.qco(w2)?$", C9800cl)
            .map(|r| r.version(ParentDir).build_file("cisco_c9800cl-{version}.qcow2")),
    ];

    table
        .into_iter()
        .filter_map(|rule| match rule {
            Ok(rule) => Some(rule),
            Err(err) => {
                tracing::error!("invalid built-in classification rule: {err}");
                None
            }
        })
        .collect()
}
