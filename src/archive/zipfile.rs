use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use tracing::debug;

use super::{MemberEntry, MemberPath};
use crate::error::{Error, Result};

pub(super) struct ZipBackend {
    archive: zip::ZipArchive<File>,
}

pub(super) fn open(path: &Path, file: File) -> Result<(ZipBackend, Vec<MemberEntry>)> {
    let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::corrupt(path, e))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let member = archive
            .by_index(index)
            .map_err(|e| Error::corrupt(path, e))?;
        if member.is_dir() {
            continue;
        }
        let Some(name) = member.enclosed_name() else {
            debug!(member = member.name(), "skipping member outside the archive root");
            continue;
        };
        if let Some(member_path) = MemberPath::new(&name.to_string_lossy()) {
            entries.push(MemberEntry::new(index, member_path, member.size()));
        }
    }

    Ok((ZipBackend { archive }, entries))
}

impl ZipBackend {
    pub(super) fn open(&mut self, index: usize) -> io::Result<Box<dyn Read + '_>> {
        let member = self.archive.by_index(index).map_err(io::Error::other)?;
        Ok(Box::new(member))
    }
}
