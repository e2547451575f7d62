//! File-backed [`Transport`] for a helper running as a separate process.
//!
//! Every shared object is a file under a directory both processes agree on,
//! mapped shared into each address space. A region `name` is the file `name`
//! plus a lock word in `name.lock`; a signal is a sequence counter in
//! `name.event` and a waiter fires when the counter moved since it last
//! looked, which gives auto-reset semantics.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use memmap2::MmapMut;

use crate::ipc::{SharedRegion, Signal, Transport, Waitable};

/// Environment variable that hands the object directory to the helper.
pub const OBJECT_DIR_ENV: &str = "QSV_BRIDGE_DIR";

const POLL_SLICE: Duration = Duration::from_millis(1);
const SPIN_LIMIT: u32 = 64;

const LOCK_SUFFIX: &str = ".lock";
const EVENT_SUFFIX: &str = ".event";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct MappedTransport {
    dir: PathBuf,
}

impl MappedTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("create object dir {}: {}", dir.display(), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes the files of every object whose name starts with `prefix`.
    pub fn remove_objects(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        log::debug!("removed {} objects of {}", removed, prefix);
        Ok(removed)
    }

    /// Maps `file_name`, creating it zero-filled with `len` bytes if it is new.
    fn map(&self, file_name: &str, len: usize) -> Result<MmapMut> {
        let path = self.dir.join(file_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
        let existing = file.metadata()?.len() as usize;
        if existing == 0 {
            file.set_len(len as u64)?;
        } else if existing < len {
            anyhow::bail!(
                "region {} is {} bytes, {} requested",
                file_name,
                existing,
                len
            );
        }
        // SAFETY: the file stays mapped for the lifetime of the MmapMut, and
        // concurrent access from the peer only goes through the lock word or
        // atomics.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(map)
    }

    fn map_word(&self, file_name: &str) -> Result<MmapMut> {
        self.map(file_name, 8)
    }
}

impl Transport for MappedTransport {
    fn open_region(&self, name: &str, len: usize) -> Result<Arc<dyn SharedRegion>> {
        let data = self.map(name, len)?;
        let word = self.map_word(&format!("{}{}", name, LOCK_SUFFIX))?;
        Ok(Arc::new(MappedRegion {
            name: name.to_string(),
            data: Mutex::new(data),
            lock: word,
        }))
    }

    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>> {
        let word = self.map_word(&format!("{}{}", name, EVENT_SUFFIX))?;
        Ok(Arc::new(MappedSignal {
            name: name.to_string(),
            word,
            seen: AtomicU64::new(0),
        }))
    }

    fn wait_any(&self, objects: &[&dyn Waitable], timeout: Option<Duration>) -> Option<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(index) = objects.iter().position(|o| o.poll()) {
                return Some(index);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };
            std::thread::sleep(slice);
        }
    }
}

/// Views the first word of a mapping as an atomic.
///
/// # Safety
/// The mapping must be at least 8 bytes long. Mappings are page aligned.
unsafe fn atomic_u32(map: &MmapMut) -> &AtomicU32 {
    unsafe { &*(map.as_ptr() as *const AtomicU32) }
}

unsafe fn atomic_u64(map: &MmapMut) -> &AtomicU64 {
    unsafe { &*(map.as_ptr() as *const AtomicU64) }
}

struct WordGuard<'a>(&'a AtomicU32);

impl Drop for WordGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

pub struct MappedRegion {
    name: String,
    data: Mutex<MmapMut>,
    lock: MmapMut,
}

impl MappedRegion {
    /// Takes the cross-process lock word.
    fn acquire(&self) -> WordGuard<'_> {
        // SAFETY: lock files are mapped with 8 bytes.
        let word = unsafe { atomic_u32(&self.lock) };
        let mut spins = 0;
        while word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        WordGuard(word)
    }

    fn check(&self, offset: usize, len: usize, total: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= total => Ok(()),
            _ => anyhow::bail!(
                "access {}..{} outside region {} of {} bytes",
                offset,
                offset.saturating_add(len),
                self.name,
                total
            ),
        }
    }
}

impl SharedRegion for MappedRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        lock(&self.data).len()
    }

    fn with_locked(&self, f: &mut dyn FnMut(&mut [u8])) {
        let mut data = lock(&self.data);
        let _guard = self.acquire();
        f(&mut data[..]);
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let data = lock(&self.data);
        self.check(offset, buf.len(), data.len())?;
        let _guard = self.acquire();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = lock(&self.data);
        self.check(offset, bytes.len(), data.len())?;
        let _guard = self.acquire();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

pub struct MappedSignal {
    name: String,
    word: MmapMut,
    /// Counter value this opener last consumed.
    seen: AtomicU64,
}

impl MappedSignal {
    fn counter(&self) -> &AtomicU64 {
        // SAFETY: event files are mapped with 8 bytes.
        unsafe { atomic_u64(&self.word) }
    }
}

impl Signal for MappedSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) {
        self.counter().fetch_add(1, Ordering::Release);
    }

    fn waitable(&self) -> &dyn Waitable {
        self
    }
}

impl Waitable for MappedSignal {
    fn poll(&self) -> bool {
        let current = self.counter().load(Ordering::Acquire);
        self.seen.swap(current, Ordering::AcqRel) != current
    }
}

/// Fresh directory under the system temp dir.
#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "qsv-bridge-{}-{}-{}",
        tag,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ))
}
