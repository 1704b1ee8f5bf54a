//! An in-memory tree that records every mutating call, for walker and engine tests.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use super::{Directory, Entry, FileHandle};

type Log = Rc<RefCell<Vec<String>>>;

enum Child {
    File(Rc<RefCell<MemFileData>>),
    Dir(Rc<RefCell<Vec<(String, Child)>>>),
}

struct MemFileData {
    bytes: Vec<u8>,
    broken: bool,
}

/// A directory handle. Subdirectories list `.` and `..` first, as FAT does.
#[derive(Clone)]
pub struct MemDir {
    children: Rc<RefCell<Vec<(String, Child)>>>,
    parent: Option<Box<MemDir>>,
    path: String,
    log: Log,
}

pub struct MemFile {
    data: Rc<RefCell<MemFileData>>,
    path: String,
    log: Log,
}

impl MemDir {
    pub fn root() -> Self {
        Self {
            children: Rc::default(),
            parent: None,
            path: String::new(),
            log: Log::default(),
        }
    }

    fn child_path(&self, name: &str) -> String {
        format!("{}/{name}", self.path)
    }

    /// Add a file and return `self` for chaining.
    pub fn with_file(&self, name: &str, bytes: &[u8]) -> &Self {
        self.insert_file(name, bytes, false);
        self
    }

    /// Add a file whose reads always fail.
    pub fn with_broken_file(&self, name: &str) -> &Self {
        self.insert_file(name, b"unreadable", true);
        self
    }

    fn insert_file(&self, name: &str, bytes: &[u8], broken: bool) {
        let data = MemFileData {
            bytes: bytes.to_vec(),
            broken,
        };
        self.children.borrow_mut().push((
            name.to_owned(),
            Child::File(Rc::new(RefCell::new(data))),
        ));
    }

    /// Add a subdirectory without logging it.
    pub fn subdir(&self, name: &str) -> MemDir {
        let children = Rc::default();
        self.children
            .borrow_mut()
            .push((name.to_owned(), Child::Dir(Rc::clone(&children))));
        self.handle(name, children)
    }

    fn handle(&self, name: &str, children: Rc<RefCell<Vec<(String, Child)>>>) -> MemDir {
        MemDir {
            children,
            parent: Some(Box::new(self.clone())),
            path: self.child_path(name),
            log: Rc::clone(&self.log),
        }
    }

    /// Names of the direct children, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.children
            .borrow()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every `read`, `mkdir` and `remove` so far, with the path it touched.
    pub fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn record(&self, event: String) {
        self.log.borrow_mut().push(event);
    }
}

impl Directory for MemDir {
    type File = MemFile;

    fn entries(&self) -> io::Result<Vec<Entry<Self>>> {
        let mut entries = Vec::new();
        if let Some(parent) = &self.parent {
            entries.push(Entry::directory(".", self.clone()));
            entries.push(Entry::directory("..", (**parent).clone()));
        }
        for (name, child) in self.children.borrow().iter() {
            entries.push(match child {
                Child::File(data) => Entry::file(
                    name.clone(),
                    MemFile {
                        data: Rc::clone(data),
                        path: self.child_path(name),
                        log: Rc::clone(&self.log),
                    },
                ),
                Child::Dir(children) => {
                    Entry::directory(name.clone(), self.handle(name, Rc::clone(children)))
                }
            });
        }
        Ok(entries)
    }

    fn add_directory(&self, name: &str) -> io::Result<Self> {
        if self.children.borrow().iter().any(|(n, _)| n == name) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        self.record(format!("mkdir {}", self.child_path(name)));
        Ok(self.subdir(name))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        let mut children = self.children.borrow_mut();
        let index = children
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(io::ErrorKind::NotFound)?;
        children.remove(index);
        self.record(format!("remove {}", self.child_path(name)));
        Ok(())
    }
}

impl FileHandle for MemFile {
    fn len(&self) -> u64 {
        self.data.borrow().bytes.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.log.borrow_mut().push(format!("read {}", self.path));
        let data = self.data.borrow();
        if data.broken {
            return Err(io::Error::other("bad cluster chain"));
        }
        let start = (offset as usize).min(data.bytes.len());
        let n = buf.len().min(data.bytes.len() - start);
        buf[..n].copy_from_slice(&data.bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        let mut data = self.data.borrow_mut();
        let end = offset as usize + bytes.len();
        if data.bytes.len() < end {
            data.bytes.resize(end, 0);
        }
        data.bytes[offset as usize..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
