//! Read-only view over refplat containers.
//!
//! A [`Container`] is opened once, lists its members eagerly and opens
//! member byte streams lazily by index. ZIP and ISO 9660 are told apart by
//! their magic bytes, not by extension.

mod isofs;
mod path;
mod zipfile;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub use path::MemberPath;

const ZIP_LOCAL_HEADER: &[u8; 4] = b"PK\x03\x04";
const ZIP_END_OF_DIRECTORY: &[u8; 4] = b"PK\x05\x06";
const ISO_MAGIC_OFFSET: u64 = 0x8001;
const ISO_MAGIC: &[u8; 5] = b"CD001";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    Zip,
    Iso,
}

impl ContainerFormat {
    /// Format implied by a file extension, case-insensitively.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" => Some(Self::Zip),
            "iso" => Some(Self::Iso),
            _ => None,
        }
    }

    /// Detect the format from magic bytes.
    pub fn sniff<R: Read + Seek>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut head = [0u8; 4];
        if read_exact_or_short(reader, &mut head)?
            && (&head == ZIP_LOCAL_HEADER || &head == ZIP_END_OF_DIRECTORY)
        {
            return Ok(Some(Self::Zip));
        }

        let mut magic = [0u8; 5];
        reader.seek(SeekFrom::Start(ISO_MAGIC_OFFSET))?;
        if read_exact_or_short(reader, &mut magic)? && &magic == ISO_MAGIC {
            return Ok(Some(Self::Iso));
        }
        Ok(None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Iso => "iso",
        }
    }
}

/// One file inside a container.
#[derive(Debug, Clone)]
pub struct MemberEntry {
    index: usize,
    path: MemberPath,
    size: u64,
}

impl MemberEntry {
    pub(crate) fn new(index: usize, path: MemberPath, size: u64) -> Self {
        Self { index, path, size }
    }

    /// Position used to open the member's byte stream.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &MemberPath {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

enum Backend {
    Zip(zipfile::ZipBackend),
    Iso(isofs::IsoBackend),
}

/// An opened ZIP or ISO container. The file handle is released on drop.
pub struct Container {
    path: PathBuf,
    name: String,
    format: ContainerFormat,
    entries: Vec<MemberEntry>,
    backend: Backend,
}

impl Container {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::corrupt(path, e))?;
        let format = match ContainerFormat::sniff(&mut file) {
            Ok(Some(format)) => format,
            Ok(None) => return Err(unrecognized(path)),
            Err(e) => return Err(Error::corrupt(path, e)),
        };
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::corrupt(path, e))?;

        let (backend, entries) = match format {
            ContainerFormat::Zip => {
                let (backend, entries) = zipfile::open(path, file)?;
                (Backend::Zip(backend), entries)
            }
            ContainerFormat::Iso => {
                let (backend, entries) = isofs::open(path, file)?;
                (Backend::Iso(backend), entries)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            name: container_name(path),
            format,
            entries,
            backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name without extension; names the container's output directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn entries(&self) -> &[MemberEntry] {
        &self.entries
    }

    /// Open the byte stream of the member at `index`.
    pub fn open_member(&mut self, index: usize) -> io::Result<Box<dyn Read + '_>> {
        match &mut self.backend {
            Backend::Zip(zip) => zip.open(index),
            Backend::Iso(iso) => iso.open(index),
        }
    }
}

/// Base name of a container file without its extension.
pub fn container_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn unrecognized(path: &Path) -> Error {
    match ContainerFormat::from_extension(path) {
        Some(expected) => Error::corrupt(
            path,
            format!("missing {} signature", expected.as_str().to_uppercase()),
        ),
        None => Error::UnsupportedFormat {
            path: path.to_path_buf(),
        },
    }
}

/// Fill `buf` completely; `false` when the reader ends first.
fn read_exact_or_short<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
