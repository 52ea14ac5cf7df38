//! Platform classification of container members.
//!
//! Classification looks at the member's file name (and, for some rules, its
//! parent directory) and returns exactly one [`ClassificationResult`]. Rules
//! are tried in priority order. The first match fixes the identity; matches
//! from rules of *other* platforms make the result ambiguous.

mod rules;
pub mod version;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::archive::MemberPath;

pub use rules::{builtin_rules, Rule, RuleSpec, VersionSource, VersionTransform};

/// Cisco virtual platform families found in refplat containers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Asav,
    Cat9kv,
    N9kv,
    Xrv9k,
    Csr1000v,
    C8000v,
    Iol,
    Ise,
    Vios,
    Viosl2,
    Ftdv,
    Fmc,
    C9800cl,
}

impl Platform {
    pub const ALL: [Platform; 13] = [
        Platform::Asav,
        Platform::Cat9kv,
        Platform::N9kv,
        Platform::Xrv9k,
        Platform::Csr1000v,
        Platform::C8000v,
        Platform::Iol,
        Platform::Ise,
        Platform::Vios,
        Platform::Viosl2,
        Platform::Ftdv,
        Platform::Fmc,
        Platform::C9800cl,
    ];

    /// Lowercase tag used in paths, config keys and image tags.
    pub fn slug(self) -> &'static str {
        match self {
            Platform::Asav => "asav",
            Platform::Cat9kv => "cat9kv",
            Platform::N9kv => "n9kv",
            Platform::Xrv9k => "xrv9k",
            Platform::Csr1000v => "csr1000v",
            Platform::C8000v => "c8000v",
            Platform::Iol => "iol",
            Platform::Ise => "ise",
            Platform::Vios => "vios",
            Platform::Viosl2 => "viosl2",
            Platform::Ftdv => "ftdv",
            Platform::Fmc => "fmc",
            Platform::C9800cl => "c9800cl",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Asav => "ASAv",
            Platform::Cat9kv => "Cat9kv",
            Platform::N9kv => "N9Kv",
            Platform::Xrv9k => "XRv9k",
            Platform::Csr1000v => "CSR1000V",
            Platform::C8000v => "C8000v",
            Platform::Iol => "IOL",
            Platform::Ise => "ISE",
            Platform::Vios => "vIOS",
            Platform::Viosl2 => "vIOS-L2",
            Platform::Ftdv => "FTDv",
            Platform::Fmc => "FMC",
            Platform::C9800cl => "C9800-CL",
        }
    }

    /// vrnetlab directory building this platform, relative to the checkout.
    ///
    /// `None` for platforms vrnetlab has no builder for.
    pub fn default_builder_dir(self) -> Option<&'static str> {
        match self {
            Platform::Asav => Some("cisco/asav"),
            Platform::Cat9kv => Some("cisco/cat9kv"),
            Platform::N9kv => Some("cisco/n9kv"),
            Platform::Xrv9k => Some("cisco/xrv9k"),
            Platform::Csr1000v => Some("cisco/csr1000v"),
            Platform::C8000v => Some("cisco/c8000v"),
            Platform::Iol => Some("cisco/iol"),
            Platform::Ise => Some("cisco/ise"),
            Platform::Vios => Some("cisco/vios"),
            Platform::Viosl2 => Some("cisco/viosl2"),
            Platform::Ftdv => Some("cisco/ftdv"),
            Platform::Fmc | Platform::C9800cl => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.slug() == wanted)
            .ok_or_else(|| format!("unknown platform '{s}'"))
    }
}

/// What a member image is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PlatformIdentity {
    pub platform: Platform,
    pub version: String,
    pub variant: Option<String>,
}

impl PlatformIdentity {
    pub fn new(platform: Platform, version: &str, variant: Option<&str>) -> Self {
        Self {
            platform,
            version: version.to_string(),
            variant: variant.map(str::to_string),
        }
    }
}

impl fmt::Display for PlatformIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.platform, self.version)?;
        if let Some(variant) = &self.variant {
            write!(f, " ({variant})")?;
        }
        Ok(())
    }
}

/// A successful classification together with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMatch {
    pub identity: PlatformIdentity,
    pub rule: String,
    /// File name the platform's builder expects.
    pub build_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationResult {
    Matched(ImageMatch),
    Unrecognized,
    /// One candidate per matching platform, in rule priority order.
    Ambiguous(Vec<PlatformIdentity>),
}

impl ClassificationResult {
    pub fn identity(&self) -> Option<&PlatformIdentity> {
        match self {
            ClassificationResult::Matched(m) => Some(&m.identity),
            _ => None,
        }
    }
}

/// Ordered rule table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Classifier {
    pub fn builtin() -> Self {
        Self::with_rules(builtin_rules())
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Put `overrides` ahead of the current table.
    pub fn with_overrides(mut self, overrides: Vec<Rule>) -> Self {
        let mut rules = overrides;
        rules.append(&mut self.rules);
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Classify one member. `fallback_version` stands in when a parent-dir
    /// rule finds no usable directory name.
    pub fn classify(&self, path: &MemberPath, fallback_version: &str) -> ClassificationResult {
        let mut first: Option<ImageMatch> = None;
        let mut candidates: Vec<PlatformIdentity> = Vec::new();

        for rule in &self.rules {
            if candidates.iter().any(|c| c.platform == rule.platform()) {
                continue;
            }
            let Some(found) = rule.evaluate(path, fallback_version) else {
                continue;
            };
            candidates.push(found.identity.clone());
            if first.is_none() {
                first = Some(found);
            }
        }

        match first {
            None => ClassificationResult::Unrecognized,
            Some(found) if candidates.len() == 1 => ClassificationResult::Matched(found),
            Some(_) => ClassificationResult::Ambiguous(candidates),
        }
    }
}
