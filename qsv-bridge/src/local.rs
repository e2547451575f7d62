//! In-process [`Transport`]. Both peers live in the same address space and
//! share objects by name, which is how the simulated helper and the tests
//! drive a real session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::ipc::{HelperProcess, ProcessState, SharedRegion, Signal, Transport, Waitable};

/// Upper bound of a single condvar sleep, so waitables that never ring the
/// doorbell (e.g. a real child process) are still re-polled.
const POLL_SLICE: Duration = Duration::from_millis(5);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct Doorbell {
    rings: Mutex<u64>,
    cond: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *lock(&self.rings) += 1;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct Shared {
    regions: Mutex<HashMap<String, Arc<LocalRegion>>>,
    signals: Mutex<HashMap<String, Arc<LocalSignal>>>,
    doorbell: Arc<Doorbell>,
}

#[derive(Clone, Default)]
pub struct LocalTransport {
    shared: Arc<Shared>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a process handle whose exit wakes waiters of this transport.
    pub fn spawn_process(&self) -> Arc<LocalProcess> {
        static NEXT_PID: AtomicU32 = AtomicU32::new(1000);
        Arc::new(LocalProcess {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            exit: Mutex::new(None),
            doorbell: self.shared.doorbell.clone(),
        })
    }

    pub fn region_names(&self) -> Vec<String> {
        lock(&self.shared.regions).keys().cloned().collect()
    }
}

impl Transport for LocalTransport {
    fn open_region(&self, name: &str, len: usize) -> Result<Arc<dyn SharedRegion>> {
        let mut regions = lock(&self.shared.regions);
        if let Some(region) = regions.get(name) {
            if region.len() < len {
                anyhow::bail!(
                    "region {} is {} bytes, {} requested",
                    name,
                    region.len(),
                    len
                );
            }
            return Ok(region.clone());
        }
        let region = Arc::new(LocalRegion {
            name: name.to_string(),
            data: Mutex::new(vec![0u8; len]),
        });
        regions.insert(name.to_string(), region.clone());
        Ok(region)
    }

    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>> {
        let mut signals = lock(&self.shared.signals);
        let signal = signals
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(LocalSignal {
                    name: name.to_string(),
                    set: Mutex::new(false),
                    doorbell: self.shared.doorbell.clone(),
                })
            })
            .clone();
        Ok(signal)
    }

    fn wait_any(&self, objects: &[&dyn Waitable], timeout: Option<Duration>) -> Option<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let doorbell = &self.shared.doorbell;
        loop {
            let seen = *lock(&doorbell.rings);
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
            let rings = lock(&doorbell.rings);
            if *rings == seen {
                let _ = doorbell.cond.wait_timeout(rings, slice);
            }
        }
    }
}

pub struct LocalRegion {
    name: String,
    data: Mutex<Vec<u8>>,
}

impl LocalRegion {
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

impl SharedRegion for LocalRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        lock(&self.data).len()
    }

    fn with_locked(&self, f: &mut dyn FnMut(&mut [u8])) {
        let mut data = lock(&self.data);
        f(&mut data[..]);
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let data = lock(&self.data);
        self.check(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = lock(&self.data);
        self.check(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

pub struct LocalSignal {
    name: String,
    set: Mutex<bool>,
    doorbell: Arc<Doorbell>,
}

impl Signal for LocalSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self) {
        *lock(&self.set) = true;
        self.doorbell.ring();
    }

    fn waitable(&self) -> &dyn Waitable {
        self
    }
}

impl Waitable for LocalSignal {
    fn poll(&self) -> bool {
        std::mem::replace(&mut *lock(&self.set), false)
    }
}

/// Stand-in for the helper's process handle.
pub struct LocalProcess {
    pid: u32,
    exit: Mutex<Option<Option<i32>>>,
    doorbell: Arc<Doorbell>,
}

impl LocalProcess {
    pub fn exit(&self, code: i32) {
        *lock(&self.exit) = Some(Some(code));
        self.doorbell.ring();
    }
}

impl HelperProcess for LocalProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> ProcessState {
        match *lock(&self.exit) {
            Some(code) => ProcessState::Exited(code),
            None => ProcessState::Running,
        }
    }

    fn waitable(&self) -> &dyn Waitable {
        self
    }
}

impl Waitable for LocalProcess {
    fn poll(&self) -> bool {
        lock(&self.exit).is_some()
    }
}
