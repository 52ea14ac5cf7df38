use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use cdfs::{DirectoryEntry, ISODirectory, ISOFile, ISO9660};

use super::{MemberEntry, MemberPath};
use crate::error::{Error, Result};

pub(super) struct IsoBackend {
    files: Vec<ISOFile<File>>,
    _image: ISO9660<File>,
}

pub(super) fn open(path: &Path, file: File) -> Result<(IsoBackend, Vec<MemberEntry>)> {
    let image = ISO9660::new(file).map_err(|e| Error::corrupt(path, e))?;
    let root = match image.open("/") {
        Ok(Some(DirectoryEntry::Directory(root))) => root,
        Ok(_) => return Err(Error::corrupt(path, "missing root directory")),
        Err(e) => return Err(Error::corrupt(path, e)),
    };

    let mut files = Vec::new();
    let mut entries = Vec::new();
    walk(&root, "", &mut files, &mut entries).map_err(|reason| Error::corrupt(path, reason))?;

    Ok((
        IsoBackend {
            files,
            _image: image,
        },
        entries,
    ))
}

/// Depth-first walk in directory order.
fn walk(
    dir: &ISODirectory<File>,
    prefix: &str,
    files: &mut Vec<ISOFile<File>>,
    entries: &mut Vec<MemberEntry>,
) -> std::result::Result<(), String> {
    for entry in dir.contents() {
        match entry.map_err(|e| e.to_string())? {
            DirectoryEntry::Directory(child) => {
                if is_self_or_parent(&child.identifier) {
                    continue;
                }
                let child_prefix = format!("{prefix}{}/", child.identifier);
                walk(&child, &child_prefix, files, entries)?;
            }
            DirectoryEntry::File(file) => {
                let raw = format!("{prefix}{}", file.identifier);
                if let Some(path) = MemberPath::new(&raw) {
                    entries.push(MemberEntry::new(files.len(), path, u64::from(file.size())));
                    files.push(file);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_self_or_parent(identifier: &str) -> bool {
    matches!(identifier, "." | ".." | "\0" | "\u{1}")
}

impl IsoBackend {
    pub(super) fn open(&mut self, index: usize) -> io::Result<Box<dyn Read + '_>> {
        let file = self.files.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no ISO member at index {index}"))
        })?;
        Ok(Box::new(file.read()))
    }
}
