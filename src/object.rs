//! The source elf object

use crate::Result;
use crate::error::io_error;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// The source elf object
pub trait ElfObject {
    /// Returns the elf object name
    fn file_name(&self) -> &str;
    /// Returns the total size of the elf object in bytes
    fn size(&mut self) -> Result<usize>;
    /// Read data from the elf object
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()>;
}

/// An elf file stored in memory
pub struct ElfBinary<'bytes> {
    name: String,
    bytes: &'bytes [u8],
}

impl<'bytes> ElfBinary<'bytes> {
    pub fn new(name: &str, bytes: &'bytes [u8]) -> Self {
        Self {
            name: name.to_string(),
            bytes,
        }
    }
}

impl ElfObject for ElfBinary<'_> {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn size(&mut self) -> Result<usize> {
        Ok(self.bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(io_error(format!("read past end of `{}`", self.name)));
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }
}

/// An elf file saved in a file
pub struct ElfFile {
    path: String,
    file: File,
}

impl ElfFile {
    pub fn from_path(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| io_error(format!("could not open `{path}`")))?;
        Ok(ElfFile {
            path: path.to_string(),
            file,
        })
    }
}

impl ElfObject for ElfFile {
    fn file_name(&self) -> &str {
        &self.path
    }

    fn size(&mut self) -> Result<usize> {
        let meta = self
            .file
            .metadata()
            .map_err(|_| io_error(format!("could not stat `{}`", self.path)))?;
        Ok(meta.len() as usize)
    }

    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|_| io_error(format!("could not read `{}`", self.path)))
    }
}
