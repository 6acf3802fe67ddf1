//! Shared segment manager: file-backed, read-write shared mappings at
//! deterministic paths.
//!
//! A segment file is created by the first subscriber, grown in place with
//! `set_len` (extension zero-fills, shrinking is never requested), and
//! unlinked by the last unsubscriber so a later re-subscription to the same
//! name starts from fresh bytes. The mapping address is only valid until
//! the next remap, so positions inside a segment are carried as
//! [`ShmOff`] byte offsets and re-based against the current mapping on
//! every access, never as raw pointers.
//!
//! Creation races between processes are serialized by the module directory,
//! which registers subscriptions under its own lock before any two
//! processes can open the same segment name.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use once_cell::sync::Lazy;

use crate::errors::{Error, Result};

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize);

/// Round `size` up to the next page-size multiple. Segment sizes are always
/// page-aligned.
pub fn page_align(size: usize) -> usize {
    size.div_ceil(*PAGE_SIZE) * *PAGE_SIZE
}

/// Byte offset into a segment. Only meaningful together with the segment it
/// was produced for; callers re-base it against the current mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmOff(pub u32);

/// An open, mapped shared segment.
pub struct SubShm {
    file: File,
    path: PathBuf,
    size: usize,
    map: Option<MmapMut>,
    created: bool,
}

fn map_err(err: io::Error) -> Error {
    if err.raw_os_error() == Some(libc::ENOMEM) {
        Error::OutOfMemory
    } else {
        Error::Io(err)
    }
}

impl SubShm {
    /// Open the segment file at `path`, creating it if needed, and map at
    /// least `min_size` bytes (page-aligned). A zero-length file marks this
    /// process as the creator; the caller must then initialize the header,
    /// embedded lock included.
    pub fn open_map(path: &Path, min_size: usize) -> Result<SubShm> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)?;
        let mut shm = SubShm {
            file,
            path: path.to_path_buf(),
            size: 0,
            map: None,
            created: false,
        };

        let file_size = shm.file_size()? as usize;
        if file_size < page_align(min_size) {
            shm.created = file_size == 0;
            shm.ensure_size(min_size)?;
        } else {
            shm.remap(None)?;
        }
        Ok(shm)
    }

    /// Open an already existing segment without ever creating it; the
    /// publisher side uses this, since only subscribers create segments.
    pub fn open_existing(path: &Path, min_size: usize) -> Result<SubShm> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("shared segment {}", path.display())));
            }
            Err(err) => return Err(err.into()),
        };
        let mut shm = SubShm {
            file,
            path: path.to_path_buf(),
            size: 0,
            map: None,
            created: false,
        };
        if shm.file_size()? < min_size as u64 {
            return Err(Error::NotFound(format!(
                "initialized shared segment {}",
                path.display()
            )));
        }
        shm.remap(None)?;
        Ok(shm)
    }

    /// Whether this process created the backing file and owes the header
    /// initialization.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Currently mapped size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Grow the backing file to at least `min_size` (page-aligned) and
    /// remap. No-op when the mapping already has that size; growing never
    /// loses previously written bytes, extension zero-fills.
    pub fn ensure_size(&mut self, min_size: usize) -> Result<()> {
        let mut new_size = page_align(min_size);
        if new_size <= self.size && self.map.is_some() {
            return Ok(());
        }

        // the old mapping must go before the file changes size
        self.map = None;
        let file_size = self.file_size()? as usize;
        if file_size > new_size {
            // another process grew it further already; never shrink
            new_size = file_size;
        } else if file_size != new_size {
            self.file.set_len(new_size as u64)?;
        }
        self.size = new_size;
        self.map = Some(unsafe { MmapMut::map_mut(&self.file) }.map_err(map_err)?);
        Ok(())
    }

    /// Refresh the mapping. With `new_size` this truncates the file first;
    /// without, it reads the current file size (another process may have
    /// grown the segment) and remaps only when it changed.
    pub fn remap(&mut self, new_size: Option<usize>) -> Result<()> {
        if let Some(size) = new_size {
            return self.ensure_size(size);
        }

        let file_size = self.file_size()? as usize;
        if file_size == self.size && self.map.is_some() {
            return Ok(());
        }
        self.map = None;
        self.size = file_size;
        self.map = Some(unsafe { MmapMut::map_mut(&self.file) }.map_err(map_err)?);
        Ok(())
    }

    /// The mapped bytes. The segment must be mapped; every constructor
    /// leaves it mapped and only [`SubShm::clear`] unmaps.
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().expect("segment is not mapped")
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().expect("segment is not mapped")
    }

    /// Read `len` bytes at `off`, re-based against the current mapping.
    pub fn read_at(&self, off: ShmOff, len: usize) -> &[u8] {
        &self.bytes()[off.0 as usize..off.0 as usize + len]
    }

    /// Drop the mapping. Idempotent; the file descriptor closes when the
    /// segment is dropped.
    pub fn clear(&mut self) {
        self.map = None;
        self.size = 0;
    }

    /// Remove the backing file. Called by the last unsubscriber so no stale
    /// event survives into a future re-subscription of the same name; a
    /// failure is logged, the mapping teardown proceeds regardless.
    pub fn unlink_file(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to unlink segment {} ({err})", self.path.display());
        }
    }
}

/// Append-only cursor over a segment's payload region. Returns typed
/// offsets; the caller grows the segment up front so appends never run past
/// the mapping.
pub struct ShmCursor {
    end: usize,
}

impl ShmCursor {
    /// Start appending at byte offset `start` (usually the end of the fixed
    /// header).
    pub fn new(start: usize) -> ShmCursor {
        ShmCursor { end: start }
    }

    /// Copy `data` at the cursor and advance, returning the offset the data
    /// landed at.
    pub fn append(&mut self, shm: &mut SubShm, data: &[u8]) -> Result<ShmOff> {
        let off = self.end;
        let end = off + data.len();
        if end > shm.len() {
            return Err(Error::Internal(format!(
                "append of {} bytes at offset {off} runs past segment of {} bytes",
                data.len(),
                shm.len()
            )));
        }
        shm.bytes_mut()[off..end].copy_from_slice(data);
        self.end = end;
        Ok(ShmOff(off as u32))
    }

    /// Current end of the appended region.
    pub fn end(&self) -> usize {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.running");

        let shm = SubShm::open_map(&path, 64).unwrap();
        assert!(shm.created());
        assert_eq!(shm.len() % page_align(1), 0);
        assert!(shm.len() >= 64);
        drop(shm);

        // the file persists, a second open is not a creation
        let shm = SubShm::open_map(&path, 64).unwrap();
        assert!(!shm.created());
    }

    #[test]
    fn open_existing_requires_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.rpc.00000001");
        match SubShm::open_existing(&path, 64) {
            Err(Error::NotFound(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn grow_preserves_bytes() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.state.00000000");

        let mut shm = SubShm::open_map(&path, 128).unwrap();
        shm.bytes_mut()[..4].copy_from_slice(b"hdr!");
        let old_size = shm.len();

        shm.ensure_size(old_size + 1).unwrap();
        assert!(shm.len() > old_size);
        assert_eq!(&shm.bytes()[..4], b"hdr!");
        // extension is zero-filled
        assert!(shm.bytes()[old_size..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ensure_size_is_noop_when_unchanged() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.notif");

        let mut shm = SubShm::open_map(&path, 64).unwrap();
        let size = shm.len();
        let addr = shm.bytes().as_ptr();
        shm.ensure_size(size).unwrap();
        assert_eq!(shm.len(), size);
        assert_eq!(shm.bytes().as_ptr(), addr);
    }

    #[test]
    fn remap_follows_foreign_growth() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.running");

        let mut a = SubShm::open_map(&path, 64).unwrap();
        let mut b = SubShm::open_map(&path, 64).unwrap();
        let grown = a.len() * 2;
        a.ensure_size(grown).unwrap();
        a.bytes_mut()[grown - 1] = 0xee;

        b.remap(None).unwrap();
        assert_eq!(b.len(), grown);
        assert_eq!(b.bytes()[grown - 1], 0xee);
    }

    #[test]
    fn cursor_appends_and_rebases() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.rpc.0000beef");

        let mut shm = SubShm::open_map(&path, 64).unwrap();
        let mut cur = ShmCursor::new(16);
        let off1 = cur.append(&mut shm, b"abc").unwrap();
        let off2 = cur.append(&mut shm, b"defg").unwrap();
        assert_eq!(off1, ShmOff(16));
        assert_eq!(off2, ShmOff(19));
        assert_eq!(cur.end(), 23);

        // offsets survive a remap
        let size = shm.len();
        shm.ensure_size(size + 1).unwrap();
        assert_eq!(shm.read_at(off1, 3), b"abc");
        assert_eq!(shm.read_at(off2, 4), b"defg");
    }

    #[test]
    fn append_past_end_is_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.state.00000001");

        let mut shm = SubShm::open_map(&path, 64).unwrap();
        let len = shm.len();
        let mut cur = ShmCursor::new(len - 2);
        match cur.append(&mut shm, b"xyz") {
            Err(Error::Internal(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn clear_is_idempotent() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sr_m1.notif");

        let mut shm = SubShm::open_map(&path, 64).unwrap();
        shm.clear();
        shm.clear();
        assert!(shm.is_empty());
        assert!(path.exists());
        shm.unlink_file();
        assert!(!path.exists());
    }
}
