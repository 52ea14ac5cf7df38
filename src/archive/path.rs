use std::fmt;

use serde::{Serialize, Serializer};

/// Normalized path of a member inside a container.
///
/// The canonical form keeps the container's case. The folded form is the
/// ASCII-lowercase twin of the same byte length, so match offsets found in
/// one are valid in the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberPath {
    canonical: String,
    folded: String,
}

impl MemberPath {
    /// Normalize a raw member name. Returns `None` when nothing is left.
    pub fn new(raw: &str) -> Option<Self> {
        let replaced = raw.replace('\\', "/");
        let segments: Vec<&str> = replaced
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .map(strip_iso_version)
            .filter(|s| !s.is_empty())
            .collect();
        let (last, dirs) = segments.split_last()?;
        let last = last.strip_suffix('.').unwrap_or(last);
        if last.is_empty() {
            return None;
        }

        let mut canonical = dirs.join("/");
        if !canonical.is_empty() {
            canonical.push('/');
        }
        canonical.push_str(last);
        let folded = canonical.to_ascii_lowercase();
        Some(Self { canonical, folded })
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn folded(&self) -> &str {
        &self.folded
    }

    /// Last segment, original case.
    pub fn file_name(&self) -> &str {
        last_segment(&self.canonical)
    }

    pub fn folded_file_name(&self) -> &str {
        last_segment(&self.folded)
    }

    /// Name of the directory holding this member, if any.
    pub fn parent_name(&self) -> Option<&str> {
        let (dirs, _) = self.canonical.rsplit_once('/')?;
        Some(last_segment(dirs))
    }

    /// Case-folded extension without the dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.folded_file_name();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }
}

impl fmt::Display for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for MemberPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Strip an ISO 9660 file version such as `;1`.
fn strip_iso_version(segment: &str) -> &str {
    match segment.rsplit_once(';') {
        Some((name, version))
            if !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separators_and_leading_segments_are_removed() {
        let path = MemberPath::new("\\./virl-base-images//iosv-159-3-m10\\vios.qcow2").unwrap();
        assert_eq!(path.as_str(), "virl-base-images/iosv-159-3-m10/vios.qcow2");
        assert_eq!(path.parent_name(), Some("iosv-159-3-m10"));
    }

    #[test]
    fn test_iso_version_and_trailing_dot_are_stripped() {
        let path =
            MemberPath::new("/VIRL_BASE_IMAGES/IOL_XE_17_16_01A/X86_64_CRB_LINUX_L2.IOL;1").unwrap();
        assert_eq!(path.file_name(), "X86_64_CRB_LINUX_L2.IOL");
        assert_eq!(path.folded_file_name(), "x86_64_crb_linux_l2.iol");

        let bare = MemberPath::new("DOCS/README.;1").unwrap();
        assert_eq!(bare.file_name(), "README");
        assert_eq!(bare.extension(), None);
    }

    #[test]
    fn test_folded_form_has_same_length() {
        let path = MemberPath::new("IOL-L2-XE_17_16_01A.bin").unwrap();
        assert_eq!(path.as_str().len(), path.folded().len());
        assert_eq!(path.folded(), "iol-l2-xe_17_16_01a.bin");
        assert_eq!(path.extension(), Some("bin"));
        assert_eq!(path.parent_name(), None);
    }

    #[test]
    fn test_empty_names_are_rejected() {
        assert!(MemberPath::new("").is_none());
        assert!(MemberPath::new("/./").is_none());
        assert!(MemberPath::new("//").is_none());
    }
}
