//! Depth-first traversal of a [`Directory`] tree.

use std::io;

use crate::fs::{Directory, Entry};

/// Callbacks driven by [`walk`].
///
/// The marker mirrors the position in the tree: each directory gets its own marker from
/// [`Visitor::on_enter_directory`], which is handed back on exit together with the
/// parent's. Per-directory state, such as files waiting to be deleted, lives in it.
pub trait Visitor<D: Directory> {
    type Marker;
    type Error: From<io::Error>;

    fn on_file(&mut self, entry: &mut Entry<D>, marker: &mut Self::Marker)
    -> Result<(), Self::Error>;

    fn on_enter_directory(
        &mut self,
        dir: &D,
        name: &str,
        parent: &mut Self::Marker,
    ) -> Result<Self::Marker, Self::Error>;

    fn on_exit_directory(
        &mut self,
        dir: &D,
        name: &str,
        marker: Self::Marker,
        parent: &mut Self::Marker,
    ) -> Result<(), Self::Error>;
}

/// Visit every file and directory below `dir`, in directory order, finishing each
/// subdirectory before moving on to its next sibling. `.` and `..` are skipped.
///
/// The first error, from the directory listing or a callback, stops the walk.
pub fn walk<D, V>(dir: &D, marker: &mut V::Marker, visitor: &mut V) -> Result<(), V::Error>
where
    D: Directory,
    V: Visitor<D>,
{
    for mut entry in dir.entries()? {
        if entry.is_file() {
            visitor.on_file(&mut entry, marker)?;
            continue;
        }
        if entry.is_dot() {
            continue;
        }
        if let Some(sub) = entry.as_dir() {
            let mut child = visitor.on_enter_directory(sub, entry.name(), marker)?;
            walk(sub, &mut child, visitor)?;
            visitor.on_exit_directory(sub, entry.name(), child, marker)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::MemDir;

    /// Logs callbacks with the depth carried in the marker.
    struct Trace {
        events: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl Visitor<MemDir> for Trace {
        type Marker = usize;
        type Error = io::Error;

        fn on_file(&mut self, entry: &mut Entry<MemDir>, depth: &mut usize) -> io::Result<()> {
            if self.fail_on == Some(entry.name()) {
                return Err(io::Error::other("visitor gave up"));
            }
            self.events.push(format!("{depth} file {}", entry.name()));
            Ok(())
        }

        fn on_enter_directory(
            &mut self,
            _dir: &MemDir,
            name: &str,
            depth: &mut usize,
        ) -> io::Result<usize> {
            self.events.push(format!("{depth} enter {name}"));
            Ok(*depth + 1)
        }

        fn on_exit_directory(
            &mut self,
            _dir: &MemDir,
            name: &str,
            child: usize,
            depth: &mut usize,
        ) -> io::Result<()> {
            assert_eq!(child, *depth + 1);
            self.events.push(format!("{depth} exit {name}"));
            Ok(())
        }
    }

    fn tree() -> MemDir {
        let root = MemDir::root();
        root.with_file("a.txt", b"a");
        let sub = root.subdir("sub");
        sub.with_file("b.txt", b"b");
        sub.subdir("deeper").with_file("c.txt", b"c");
        root.with_file("d.txt", b"d");
        root
    }

    fn trace(fail_on: Option<&'static str>) -> Trace {
        Trace {
            events: Vec::new(),
            fail_on,
        }
    }

    #[test]
    fn visits_depth_first_in_directory_order() {
        let mut visitor = trace(None);
        walk(&tree(), &mut 0, &mut visitor).unwrap();
        assert_eq!(
            visitor.events,
            [
                "0 file a.txt",
                "0 enter sub",
                "1 file b.txt",
                "1 enter deeper",
                "2 file c.txt",
                "1 exit deeper",
                "0 exit sub",
                "0 file d.txt",
            ]
        );
    }

    #[test]
    fn visitor_errors_stop_the_walk() {
        let mut visitor = trace(Some("b.txt"));
        let r = walk(&tree(), &mut 0, &mut visitor);
        assert!(r.is_err());
        assert_eq!(visitor.events, ["0 file a.txt", "0 enter sub"]);
    }
}
