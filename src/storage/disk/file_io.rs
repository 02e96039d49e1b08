use crate::storage::error::{StoreError, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Pooled random-access handles on a store's backing file.
///
/// At most `max_handles` handles are checked out at once; callers beyond
/// that block until one is returned. Returned handles are kept on a free
/// list so the common path never reopens the file.
pub struct FileIo {
    path: PathBuf,
    handles: Mutex<Vec<File>>,
    permits: Mutex<usize>,
    permit_freed: Condvar,
    max_handles: usize,
    file_size: AtomicU64,
    sync_on_write: bool,
    is_closed: AtomicBool,
}

impl FileIo {
    pub fn new(path: impl Into<PathBuf>, max_handles: usize, sync_on_write: bool) -> Self {
        let max_handles = max_handles.max(1);
        Self {
            path: path.into(),
            handles: Mutex::new(Vec::with_capacity(max_handles)),
            permits: Mutex::new(max_handles),
            permit_freed: Condvar::new(),
            max_handles,
            file_size: AtomicU64::new(0),
            sync_on_write,
            is_closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates an empty backing file, truncating any existing one.
    pub fn create(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        let mut handles = self.handles.lock();
        handles.clear();
        handles.push(file);
        self.file_size.store(0, Ordering::SeqCst);
        self.is_closed.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Opens an existing backing file and records its length.
    pub fn init(&self) -> StoreResult<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.metadata()?.len();

        let mut handles = self.handles.lock();
        handles.clear();
        handles.push(file);
        self.file_size.store(len, Ordering::SeqCst);
        self.is_closed.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Length of the file as last observed or extended by a write.
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::SeqCst)
    }

    /// Reads `buf.len()` bytes at `address`.
    ///
    /// A read past the end of the file is logged and the missing tail of
    /// `buf` is zero-filled. Returns the number of bytes actually read.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> StoreResult<usize> {
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(address))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if total < buf.len() {
            log::warn!(
                "bad read of {:?} at {:#x}: wanted {} bytes, got {}",
                self.path,
                address,
                buf.len(),
                total
            );
            buf[total..].fill(0);
        }

        Ok(total)
    }

    /// Writes `data` at `address`, extending the file when needed.
    pub fn write(&self, address: u64, data: &[u8]) -> StoreResult<()> {
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(address))?;
        file.write_all(data)?;

        if self.sync_on_write {
            file.sync_data()?;
        }

        self.file_size
            .fetch_max(address + data.len() as u64, Ordering::SeqCst);

        Ok(())
    }

    pub fn sync(&self) -> StoreResult<()> {
        let file = self.open_handle()?;
        file.sync_all()?;
        Ok(())
    }

    /// Drops all cached handles. Handles checked out at this moment are
    /// closed when returned.
    pub fn close(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.handles.lock().clear();
    }

    /// Closes the file and deletes it.
    pub fn remove(&self) -> StoreResult<()> {
        self.close();

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open_handle(&self) -> StoreResult<FileHandle<'_>> {
        if self.is_closed.load(Ordering::SeqCst) {
            return Err(StoreError::StoreClosed(self.path.display().to_string()));
        }

        {
            let mut permits = self.permits.lock();
            while *permits == 0 {
                self.permit_freed.wait(&mut permits);
            }
            *permits -= 1;
        }

        let cached = self.handles.lock().pop();

        let file = match cached {
            Some(file) => file,
            None => match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => file,
                Err(e) => {
                    self.release_permit();
                    return Err(e.into());
                }
            },
        };

        Ok(FileHandle {
            io: self,
            file: Some(file),
        })
    }

    fn release_permit(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.permit_freed.notify_one();
    }

    fn return_handle(&self, file: File) {
        if !self.is_closed.load(Ordering::SeqCst) {
            let mut handles = self.handles.lock();
            if handles.len() < self.max_handles {
                handles.push(file);
            }
        }
        self.release_permit();
    }
}

impl std::fmt::Debug for FileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIo")
            .field("path", &self.path)
            .field("file_size", &self.file_size())
            .finish()
    }
}

/// A checked-out file handle, returned to the pool on drop.
struct FileHandle<'a> {
    io: &'a FileIo,
    file: Option<File>,
}

impl Deref for FileHandle<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        self.file.as_ref().expect("file handle used after return")
    }
}

impl DerefMut for FileHandle<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("file handle used after return")
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.io.return_handle(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::BLOCK_SIZE;
    use anyhow::Result;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_init() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let io = FileIo::new(&path, 8, false);
            io.create()?;
            assert_eq!(io.file_size(), 0);
            io.write(0, &[7u8; BLOCK_SIZE])?;
            assert_eq!(io.file_size(), BLOCK_SIZE as u64);
            io.close();
        }

        let io = FileIo::new(&path, 8, false);
        io.init()?;
        assert_eq!(io.file_size(), BLOCK_SIZE as u64);

        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(io.read(0, &mut buf)?, BLOCK_SIZE);
        assert!(buf.iter().all(|&b| b == 7));

        Ok(())
    }

    #[test]
    fn test_init_nonexistent_file() -> Result<()> {
        let dir = tempdir()?;
        let io = FileIo::new(dir.path().join("missing.db"), 8, false);
        assert!(io.init().is_err());
        Ok(())
    }

    #[test]
    fn test_write_past_end_extends_file() -> Result<()> {
        let dir = tempdir()?;
        let io = FileIo::new(dir.path().join("test.db"), 8, true);
        io.create()?;

        let address = 5 * BLOCK_SIZE as u64;
        io.write(address, &[5u8; BLOCK_SIZE])?;
        assert_eq!(io.file_size(), 6 * BLOCK_SIZE as u64);

        // the gap reads back as zeros
        let mut buf = vec![1u8; BLOCK_SIZE];
        io.read(BLOCK_SIZE as u64, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_short_read_is_zero_filled() -> Result<()> {
        let dir = tempdir()?;
        let io = FileIo::new(dir.path().join("test.db"), 8, false);
        io.create()?;
        io.write(0, &[9u8; 100])?;

        let mut buf = vec![0xffu8; BLOCK_SIZE];
        let read = io.read(0, &mut buf)?;
        assert_eq!(read, 100);
        assert!(buf[..100].iter().all(|&b| b == 9));
        assert!(buf[100..].iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_partial_range_write() -> Result<()> {
        let dir = tempdir()?;
        let io = FileIo::new(dir.path().join("test.db"), 8, false);
        io.create()?;
        io.write(0, &[1u8; BLOCK_SIZE])?;
        io.write(10, &[2u8; 4])?;

        let mut buf = vec![0u8; 16];
        io.read(0, &mut buf)?;
        assert_eq!(&buf[8..16], &[1, 1, 2, 2, 2, 2, 1, 1]);

        Ok(())
    }

    #[test]
    fn test_concurrent_access_is_bounded() -> Result<()> {
        let dir = tempdir()?;
        let io = Arc::new(FileIo::new(dir.path().join("test.db"), 2, false));
        io.create()?;

        std::thread::scope(|s| {
            for t in 0..8u8 {
                let io = io.clone();
                s.spawn(move || {
                    let address = t as u64 * BLOCK_SIZE as u64;
                    io.write(address, &[t; BLOCK_SIZE]).unwrap();
                    let mut buf = vec![0u8; BLOCK_SIZE];
                    io.read(address, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == t));
                });
            }
        });

        assert!(io.handles.lock().len() <= 2);
        assert_eq!(*io.permits.lock(), 2);
        assert_eq!(io.file_size(), 8 * BLOCK_SIZE as u64);

        Ok(())
    }

    #[test]
    fn test_remove() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let io = FileIo::new(&path, 8, false);
        io.create()?;
        assert!(path.exists());

        io.remove()?;
        assert!(!path.exists());
        // removing twice is harmless
        io.remove()?;

        let mut buf = [0u8; 4];
        assert!(matches!(io.read(0, &mut buf), Err(StoreError::StoreClosed(_))));

        Ok(())
    }
}
