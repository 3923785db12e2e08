use std::cell::Cell;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir};

// One scratch directory per tool invocation. Every spill and run file of
// the pipelines lives under it, so a normal exit (or a panic unwinding the
// stack) removes all temporary state at once.
pub struct ScratchDir {
    dir: TempDir,
    next_id: Cell<u64>,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> io::Result<ScratchDir> {
        let dir = Builder::new().prefix(prefix).tempdir()?;
        Ok(ScratchDir { dir, next_id: Cell::new(0) })
    }

    pub fn in_root(prefix: &str, root: &Path) -> io::Result<ScratchDir> {
        let dir = Builder::new().prefix(prefix).tempdir_in(root)?;
        Ok(ScratchDir { dir, next_id: Cell::new(0) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    // A fresh path that no other collection of this invocation uses.
    pub fn unique_path(&self, label: &str) -> PathBuf {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.dir.path().join(format!("{}.{:06}.spill", label, id))
    }
}
