//! Visitors that copy, count and locate files on a mounted volume.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs::{Directory, Entry, FileHandle};
use crate::walk::{Visitor, walk};

/// A single file that could not be copied. The backup carries on without it.
#[derive(Error, Debug)]
#[error("failed to copy {name}: {source}")]
pub struct CopyError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// Failures that end a backup run.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("destination {0} does not exist or is not a directory")]
    MissingDestination(PathBuf),

    #[error("failed to create {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete {name} after copying it: {source}")]
    Delete {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to list a directory: {0}")]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupOptions {
    /// Remove each source file once its directory has been copied.
    pub delete_after_backup: bool,
    /// Replace destination files that already exist instead of keeping them.
    pub overwrite_existing: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupOutcome {
    /// Names of the files that failed to copy, in visiting order.
    pub failed: Vec<String>,
    /// Files attempted, including skipped and failed ones.
    pub visited: u32,
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a directory's files go, and which of them are waiting to be removed from
/// the source once the directory is done.
#[derive(Debug)]
pub struct BackupFrame {
    destination: PathBuf,
    pending_deletion: Vec<String>,
}

impl BackupFrame {
    fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            pending_deletion: Vec::new(),
        }
    }

    /// Delete every queued name from `source`.
    fn flush<D: Directory>(self, source: &D) -> Result<(), BackupError> {
        for name in self.pending_deletion {
            debug!("removing {name} from the source");
            source
                .remove(&name)
                .map_err(|source| BackupError::Delete { name, source })?;
        }
        Ok(())
    }
}

/// Sibling of `to` that a copy is written to before it is moved into place.
fn partial_path(to: &Path) -> PathBuf {
    let name = to
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    to.with_file_name(format!(".{name}.part"))
}

/// Write `contents` to `to` so that `to` only ever holds a complete copy.
fn write_whole(to: &Path, contents: &[u8]) -> io::Result<()> {
    let partial = partial_path(to);
    let written = File::create(&partial)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&partial, to));
    if written.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    written
}

pub struct BackupVisitor<F> {
    options: BackupOptions,
    on_progress: F,
    visited: u32,
    failed: Vec<String>,
}

impl<F: FnMut(u32)> BackupVisitor<F> {
    /// `on_progress` receives the running number of files attempted, before each attempt.
    pub fn new(options: BackupOptions, on_progress: F) -> Self {
        Self {
            options,
            on_progress,
            visited: 0,
            failed: Vec::new(),
        }
    }

    fn copy<D: Directory>(&self, entry: &mut Entry<D>, to: &Path) -> Result<(), CopyError> {
        let name = entry.name().to_owned();
        let fail = |source: io::Error| CopyError {
            name: name.clone(),
            source,
        };
        if to.exists() && !self.options.overwrite_existing {
            debug!("{} already exists, skipping", to.display());
            return Ok(());
        }
        let file = entry
            .as_file()
            .ok_or_else(|| fail(io::ErrorKind::InvalidInput.into()))?;
        let contents = file.read_all().map_err(fail)?;
        write_whole(to, &contents).map_err(fail)?;
        Ok(())
    }

    pub fn into_outcome(self) -> BackupOutcome {
        BackupOutcome {
            failed: self.failed,
            visited: self.visited,
        }
    }
}

impl<D: Directory, F: FnMut(u32)> Visitor<D> for BackupVisitor<F> {
    type Marker = BackupFrame;
    type Error = BackupError;

    fn on_file(&mut self, entry: &mut Entry<D>, frame: &mut BackupFrame) -> Result<(), BackupError> {
        self.visited += 1;
        (self.on_progress)(self.visited);
        let to = frame.destination.join(entry.name());
        match self.copy(entry, &to) {
            Ok(()) => {
                if self.options.delete_after_backup {
                    frame.pending_deletion.push(entry.name().to_owned());
                }
            }
            Err(e) => {
                warn!("{e}");
                self.failed.push(e.name);
            }
        }
        Ok(())
    }

    fn on_enter_directory(
        &mut self,
        _dir: &D,
        name: &str,
        parent: &mut BackupFrame,
    ) -> Result<BackupFrame, BackupError> {
        let path = parent.destination.join(name);
        if !path.is_dir() {
            debug!("creating {}", path.display());
            std::fs::create_dir_all(&path).map_err(|source| BackupError::CreateDirectory {
                path: path.clone(),
                source,
            })?;
        }
        Ok(BackupFrame::new(path))
    }

    fn on_exit_directory(
        &mut self,
        dir: &D,
        _name: &str,
        frame: BackupFrame,
        _parent: &mut BackupFrame,
    ) -> Result<(), BackupError> {
        frame.flush(dir)
    }
}

/// Copy everything below `source` into `destination`, which must already exist.
///
/// Per-file failures are collected in the outcome, anything else aborts the run.
pub fn run_backup<D: Directory>(
    source: &D,
    destination: &Path,
    options: BackupOptions,
    on_progress: impl FnMut(u32),
) -> Result<BackupOutcome, BackupError> {
    if !destination.is_dir() {
        return Err(BackupError::MissingDestination(destination.to_owned()));
    }
    info!("backing up to {}", destination.display());
    let mut visitor = BackupVisitor::new(options, on_progress);
    let mut root = BackupFrame::new(destination.to_owned());
    walk(source, &mut root, &mut visitor)?;
    root.flush(source)?;
    let outcome = visitor.into_outcome();
    info!(
        "backup finished: {} files, {} failed",
        outcome.visited,
        outcome.failed.len()
    );
    Ok(outcome)
}

/// Case-insensitive allow-list of file extensions. Empty lets everything through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match name.rsplit_once('.') {
            Some((_, ext)) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountOutcome {
    pub count: usize,
    /// Logical paths of the matching files, when a listing was asked for.
    pub paths: Option<Vec<String>>,
}

pub struct CountVisitor {
    filter: ExtensionFilter,
    fragments: Vec<String>,
    outcome: CountOutcome,
}

impl CountVisitor {
    /// `base` is the logical path of the directory the walk starts from.
    pub fn new(filter: ExtensionFilter, base: &str, list: bool) -> Self {
        Self {
            filter,
            fragments: base
                .split('/')
                .filter(|f| !f.is_empty())
                .map(str::to_owned)
                .collect(),
            outcome: CountOutcome {
                count: 0,
                paths: list.then(Vec::new),
            },
        }
    }

    pub fn into_outcome(self) -> CountOutcome {
        self.outcome
    }
}

impl<D: Directory> Visitor<D> for CountVisitor {
    type Marker = ();
    type Error = io::Error;

    fn on_file(&mut self, entry: &mut Entry<D>, _: &mut ()) -> io::Result<()> {
        if !self.filter.matches(entry.name()) {
            return Ok(());
        }
        self.outcome.count += 1;
        if let Some(paths) = &mut self.outcome.paths {
            let mut path = String::new();
            for fragment in self.fragments.iter().map(String::as_str).chain([entry.name()]) {
                path.push('/');
                path.push_str(fragment);
            }
            paths.push(path);
        }
        Ok(())
    }

    fn on_enter_directory(&mut self, _dir: &D, name: &str, _: &mut ()) -> io::Result<()> {
        self.fragments.push(name.to_owned());
        Ok(())
    }

    fn on_exit_directory(&mut self, _dir: &D, _name: &str, _: (), _: &mut ()) -> io::Result<()> {
        self.fragments.pop();
        Ok(())
    }
}

/// Count, and optionally list, the files below `dir` that pass `filter`.
pub fn count_files<D: Directory>(
    dir: &D,
    base: &str,
    filter: ExtensionFilter,
    list: bool,
) -> io::Result<CountOutcome> {
    let mut visitor = CountVisitor::new(filter, base, list);
    walk(dir, &mut (), &mut visitor)?;
    Ok(visitor.into_outcome())
}

/// Remembers the directory whose logical path equals the target.
pub struct NavigateVisitor<D> {
    target: String,
    found: Option<D>,
}

impl<D> NavigateVisitor<D> {
    pub fn new(target: &str) -> Self {
        Self {
            target: normalize(target),
            found: None,
        }
    }
}

/// `/`-rooted, without a trailing separator, `/` for the root.
fn normalize(path: &str) -> String {
    let trimmed: Vec<&str> = path.split('/').filter(|f| !f.is_empty()).collect();
    format!("/{}", trimmed.join("/"))
}

impl<D: Directory + Clone> Visitor<D> for NavigateVisitor<D> {
    type Marker = String;
    type Error = io::Error;

    fn on_file(&mut self, _entry: &mut Entry<D>, _path: &mut String) -> io::Result<()> {
        Ok(())
    }

    fn on_enter_directory(&mut self, dir: &D, name: &str, parent: &mut String) -> io::Result<String> {
        let path = if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        };
        // FAT names compare without regard to case
        if self.found.is_none() && path.eq_ignore_ascii_case(&self.target) {
            debug!("found {path}");
            self.found = Some(dir.clone());
        }
        Ok(path)
    }

    fn on_exit_directory(&mut self, _: &D, _: &str, _: String, _: &mut String) -> io::Result<()> {
        Ok(())
    }
}

/// The directory at `target` below `root`; `/` and the empty path name the root itself.
pub fn navigate<D: Directory + Clone>(root: &D, target: &str) -> io::Result<Option<D>> {
    let mut visitor = NavigateVisitor::new(target);
    if visitor.target == "/" {
        return Ok(Some(root.clone()));
    }
    walk(root, &mut "/".to_owned(), &mut visitor)?;
    if visitor.found.is_none() {
        warn!("{} not found on the volume", visitor.target);
    }
    Ok(visitor.found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::MemDir;

    fn sample_tree() -> MemDir {
        let root = MemDir::root();
        root.with_file("a.txt", b"alpha");
        root.subdir("sub")
            .with_file("b.txt", b"bravo")
            .with_file("c.txt", b"charlie");
        root
    }

    fn child(root: &MemDir, name: &str) -> MemDir {
        root.entries()
            .unwrap()
            .into_iter()
            .find(|e| e.name() == name)
            .and_then(|e| e.as_dir().cloned())
            .unwrap()
    }

    #[test]
    fn backup_mirrors_the_tree_and_empties_the_source() {
        let root = sample_tree();
        let dest = tempfile::tempdir().unwrap();
        let options = BackupOptions {
            delete_after_backup: true,
            overwrite_existing: true,
        };
        let mut progress = Vec::new();
        let outcome = run_backup(&root, dest.path(), options, |n| progress.push(n)).unwrap();

        assert!(outcome.is_success());
        assert_eq!(progress, [1, 2, 3]);
        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dest.path().join("sub/b.txt")).unwrap(), b"bravo");
        assert_eq!(std::fs::read(dest.path().join("sub/c.txt")).unwrap(), b"charlie");

        assert_eq!(root.names(), ["sub"]);
        assert!(child(&root, "sub").names().is_empty());

        let log = root.log();
        let at = |event: &str| log.iter().position(|e| e == event).unwrap();
        assert!(at("remove /sub/b.txt") > at("read /sub/c.txt"));
        assert!(at("remove /sub/c.txt") > at("read /sub/c.txt"));
        // the root frame is flushed once the whole walk is over
        assert!(at("remove /a.txt") > at("remove /sub/c.txt"));
    }

    #[test]
    fn existing_destination_is_kept_and_counts_as_success() {
        let root = MemDir::root();
        root.with_file("keep.jpg", b"new bytes");
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("keep.jpg"), b"old bytes").unwrap();

        let outcome = run_backup(&root, dest.path(), BackupOptions::default(), |_| {}).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.visited, 1);
        assert_eq!(std::fs::read(dest.path().join("keep.jpg")).unwrap(), b"old bytes");
        assert!(root.log().is_empty());
    }

    #[test]
    fn overwrite_replaces_existing_destination() {
        let root = MemDir::root();
        root.with_file("keep.jpg", b"new bytes");
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("keep.jpg"), b"old bytes").unwrap();

        let options = BackupOptions {
            overwrite_existing: true,
            ..Default::default()
        };
        run_backup(&root, dest.path(), options, |_| {}).unwrap();
        assert_eq!(std::fs::read(dest.path().join("keep.jpg")).unwrap(), b"new bytes");
    }

    #[test]
    fn failed_copies_are_listed_and_never_deleted() {
        let root = MemDir::root();
        root.with_file("good.jpg", b"ok").with_broken_file("bad.jpg");
        let sub = root.subdir("sub");
        sub.with_broken_file("worse.jpg");
        let dest = tempfile::tempdir().unwrap();
        let options = BackupOptions {
            delete_after_backup: true,
            overwrite_existing: false,
        };
        let outcome = run_backup(&root, dest.path(), options, |_| {}).unwrap();
        assert_eq!(outcome.failed, ["bad.jpg", "worse.jpg"]);
        assert_eq!(outcome.visited, 3);
        assert_eq!(root.names(), ["bad.jpg", "sub"]);
        assert_eq!(sub.names(), ["worse.jpg"]);
    }

    #[test]
    fn interrupted_copy_leaves_no_destination_file() {
        let root = MemDir::root();
        root.with_file("keep.jpg", b"photo");
        let dest = tempfile::tempdir().unwrap();
        let to = dest.path().join("keep.jpg");
        // nowhere to write the copy
        std::fs::create_dir(partial_path(&to)).unwrap();
        let options = BackupOptions {
            delete_after_backup: true,
            overwrite_existing: false,
        };

        let outcome = run_backup(&root, dest.path(), options, |_| {}).unwrap();
        assert_eq!(outcome.failed, ["keep.jpg"]);
        assert!(!to.exists());
        assert_eq!(root.names(), ["keep.jpg"]);

        // the next run copies the file instead of skipping it
        std::fs::remove_dir(partial_path(&to)).unwrap();
        let outcome = run_backup(&root, dest.path(), options, |_| {}).unwrap();
        assert!(outcome.is_success());
        assert_eq!(std::fs::read(&to).unwrap(), b"photo");
        assert!(!partial_path(&to).exists());
        assert!(root.names().is_empty());
    }

    #[test]
    fn missing_destination_is_an_error() {
        let dest = tempfile::tempdir().unwrap();
        let missing = dest.path().join("nope");
        let r = run_backup(&sample_tree(), &missing, BackupOptions::default(), |_| {});
        assert!(matches!(r, Err(BackupError::MissingDestination(_))));
    }

    #[test]
    fn uncreatable_directory_aborts_the_run() {
        let root = sample_tree();
        let dest = tempfile::tempdir().unwrap();
        // a file where the subdirectory should go
        std::fs::write(dest.path().join("sub"), b"in the way").unwrap();
        let r = run_backup(&root, dest.path(), BackupOptions::default(), |_| {});
        assert!(matches!(r, Err(BackupError::CreateDirectory { .. })));
    }

    fn photo_tree() -> MemDir {
        let root = MemDir::root();
        root.with_file("x.JPG", b"").with_file("y.png", b"");
        root.subdir("nested").with_file("z.jpg", b"");
        root
    }

    #[test]
    fn count_filters_by_extension_ignoring_case() {
        let outcome = count_files(&photo_tree(), "/DCIM", ExtensionFilter::new(["jpg"]), true).unwrap();
        assert_eq!(outcome.count, 2);
        assert_eq!(
            outcome.paths.unwrap(),
            ["/DCIM/x.JPG", "/DCIM/nested/z.jpg"]
        );
    }

    #[test]
    fn count_without_filter_counts_everything() {
        let outcome = count_files(&photo_tree(), "/", ExtensionFilter::default(), false).unwrap();
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.paths, None);
    }

    #[test]
    fn count_is_idempotent() {
        let tree = photo_tree();
        let filter = ExtensionFilter::new([".JPG", "png"]);
        let first = count_files(&tree, "/", filter.clone(), true).unwrap();
        let second = count_files(&tree, "/", filter, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.count, 3);
    }

    #[test]
    fn extension_filter_normalizes_entries() {
        let filter = ExtensionFilter::new([".Jpg", "", "RAW"]);
        assert!(filter.matches("a.jpg"));
        assert!(filter.matches("b.raw"));
        assert!(!filter.matches("jpg"));
        assert!(!filter.matches("c.jpeg"));
    }

    #[test]
    fn navigate_finds_nested_directories() {
        let root = MemDir::root();
        root.subdir("DCIM").subdir("100_PANO").with_file("image_01.jpg", b"");
        let found = navigate(&root, "/dcim/100_PANO/").unwrap().unwrap();
        assert_eq!(found.names(), ["image_01.jpg"]);
        assert!(navigate(&root, "/DCIM/200_PANO").unwrap().is_none());
        assert_eq!(navigate(&root, "").unwrap().unwrap().names(), ["DCIM"]);
    }
}
