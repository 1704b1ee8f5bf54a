//! The hierarchical filesystem the backup engine walks.
//!
//! [`FileSystem`], [`Directory`] and [`FileHandle`] are the only things the walker and
//! its visitors know about. The FAT volume on a stick implements them through `fatfs`;
//! tests use an in-memory tree.

#[cfg(test)]
pub mod memory;

use std::io::{self, Read, Seek, SeekFrom, Write};

/// A mounted FAT volume over `IO`.
///
/// The driver keeps `&'static dyn` time and code page hooks, so a volume is neither
/// `Send` nor `Sync` and stays on the thread that mounted it.
pub type FatFs<IO> = fatfs::FileSystem<IO>;

pub trait FileSystem {
    type Dir<'a>: Directory
    where
        Self: 'a;

    fn root(&self) -> Self::Dir<'_>;
}

pub trait Directory: Sized {
    type File: FileHandle;

    /// Entries in the order the directory stores them, `.` and `..` included when the
    /// underlying format has them.
    fn entries(&self) -> io::Result<Vec<Entry<Self>>>;

    /// Create a subdirectory and return it.
    fn add_directory(&self, name: &str) -> io::Result<Self>;

    /// Remove a file or an empty subdirectory.
    fn remove(&self, name: &str) -> io::Result<()>;
}

pub trait FileHandle {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// The whole file in one buffer.
    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let len = usize::try_from(self.len())
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "file too large"))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.read_at(filled as u64, &mut buf[filled..])? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        Ok(buf)
    }
}

enum Node<D: Directory> {
    File(D::File),
    Directory(D),
}

/// One name in a directory and what it refers to.
pub struct Entry<D: Directory> {
    name: String,
    node: Node<D>,
}

impl<D: Directory> Entry<D> {
    pub fn file(name: impl Into<String>, file: D::File) -> Self {
        Self {
            name: name.into(),
            node: Node::File(file),
        }
    }

    pub fn directory(name: impl Into<String>, dir: D) -> Self {
        Self {
            name: name.into(),
            node: Node::Directory(dir),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_file(&self) -> bool {
        matches!(self.node, Node::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.node, Node::Directory(_))
    }

    /// `.` or `..`
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// Byte length for files, 0 for directories.
    pub fn len(&self) -> u64 {
        match &self.node {
            Node::File(f) => f.len(),
            Node::Directory(_) => 0,
        }
    }

    pub fn as_file(&mut self) -> Option<&mut D::File> {
        match &mut self.node {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&D> {
        match &self.node {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }
}

pub struct FatDir<'a, IO: fatfs::ReadWriteSeek + 'a>(fatfs::Dir<'a, IO>);

impl<IO: fatfs::ReadWriteSeek> Clone for FatDir<'_, IO> {
    fn clone(&self) -> Self {
        FatDir(self.0.clone())
    }
}

pub struct FatFile<'a, IO: fatfs::ReadWriteSeek + 'a> {
    file: fatfs::File<'a, IO>,
    len: u64,
}

impl<IO: fatfs::ReadWriteSeek> FileSystem for FatFs<IO> {
    type Dir<'a>
        = FatDir<'a, IO>
    where
        Self: 'a;

    fn root(&self) -> FatDir<'_, IO> {
        FatDir(self.root_dir())
    }
}

impl<'a, IO: fatfs::ReadWriteSeek + 'a> Directory for FatDir<'a, IO> {
    type File = FatFile<'a, IO>;

    fn entries(&self) -> io::Result<Vec<Entry<Self>>> {
        self.0
            .iter()
            .map(|entry| {
                let entry = entry?;
                let name = entry.file_name();
                Ok(if entry.is_dir() {
                    Entry::directory(name, FatDir(entry.to_dir()))
                } else {
                    Entry::file(
                        name,
                        FatFile {
                            file: entry.to_file(),
                            len: entry.len(),
                        },
                    )
                })
            })
            .collect()
    }

    fn add_directory(&self, name: &str) -> io::Result<Self> {
        self.0.create_dir(name).map(FatDir)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.0.remove(name)
    }
}

impl<IO: fatfs::ReadWriteSeek> FileHandle for FatFile<'_, IO> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let n = self.file.write(data)?;
        self.len = self.len.max(offset + n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
