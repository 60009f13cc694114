//! Root controller over plain storage.
//!
//! Operations map directly onto the [`FileSystem`]. There is nothing to
//! reroute to and nothing to synchronize; errors here are genuine.

use std::io::Cursor;
use std::sync::Arc;

use nestfs_vfs::path::entry_parent;
use nestfs_vfs::{EntryType, FileSystem, FsError, FsResult};

use super::{Operation, Reply};
use crate::stream::{EntryReader, EntryWriter};

/// Controller at the root of a federation.
pub struct HostController {
    fs: Arc<dyn FileSystem>,
}

impl HostController {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    pub(crate) fn apply(&self, entry: &str, op: &Operation) -> FsResult<Reply> {
        match op {
            Operation::Stat => self.fs.stat(entry).map(Reply::Stat),
            Operation::Read => self.fs.read_file(entry).map(Reply::Data),
            Operation::Write(data) => self.fs.write_file(entry, data).map(|()| Reply::Done),
            Operation::Create(EntryType::File) => {
                if self.fs.exists(entry)? {
                    return Err(FsError::AlreadyExists);
                }
                self.fs.write_file(entry, &[]).map(|()| Reply::Done)
            }
            Operation::Create(EntryType::Directory) => self.fs.mkdir(entry).map(|()| Reply::Done),
            Operation::Delete => self.fs.remove(entry).map(|()| Reply::Done),
            Operation::List => self.fs.readdir(entry).map(Reply::List),
            Operation::OpenInput => {
                let data = self.fs.read_file(entry)?;
                Ok(Reply::Input(EntryReader::detached(Box::new(Cursor::new(
                    data,
                )))))
            }
            Operation::OpenOutput => {
                self.check_output_target(entry)?;
                Ok(Reply::Output(EntryWriter::host(self.fs.clone(), entry)))
            }
        }
    }

    /// Fail early for writers that could never be committed.
    fn check_output_target(&self, entry: &str) -> FsResult<()> {
        match self.fs.stat(entry) {
            Ok(meta) if meta.is_directory() => return Err(FsError::NotAFile),
            Ok(_) => return Ok(()),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let parent = entry_parent(entry).ok_or(FsError::NotAFile)?;
        let meta = self.fs.stat(parent)?;
        if !meta.is_directory() {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }
}
