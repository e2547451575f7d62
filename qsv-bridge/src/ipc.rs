//! Cross-process plumbing between the host and the encoder helper.
//!
//! Every shared object is opened by name through a [`Transport`]. Regions are
//! plain byte ranges with an associated cross-process lock, signals are
//! auto-reset events, and the helper process handle can be waited on together
//! with signals through [`Transport::wait_any`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

/// Something a thread can block on.
pub trait Waitable: Send + Sync {
    /// Non-blocking check. Auto-reset objects consume their notification.
    fn poll(&self) -> bool;
}

/// A named shared byte region.
pub trait SharedRegion: Send + Sync {
    fn name(&self) -> &str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the whole region while holding the region's lock.
    fn with_locked(&self, f: &mut dyn FnMut(&mut [u8]));

    /// Copies `buf.len()` bytes starting at `offset` out of the region.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Copies `data` into the region starting at `offset`.
    fn write_at(&self, offset: usize, data: &[u8]) -> Result<()>;
}

/// A named auto-reset event.
pub trait Signal: Send + Sync {
    fn name(&self) -> &str;

    fn signal(&self);

    fn waitable(&self) -> &dyn Waitable;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// Handle on the helper process. Becomes ready once the process exits.
pub trait HelperProcess: Send + Sync {
    fn pid(&self) -> u32;

    fn state(&self) -> ProcessState;

    fn waitable(&self) -> &dyn Waitable;
}

/// Opens named shared objects and waits on them.
pub trait Transport: Send + Sync {
    /// Opens the region called `name`, creating it zero-filled with `len` bytes
    /// if it does not exist yet.
    fn open_region(&self, name: &str, len: usize) -> Result<Arc<dyn SharedRegion>>;

    /// Opens the signal called `name`, creating it unset if needed.
    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>>;

    /// Blocks until one of `objects` is ready and returns its index, or `None`
    /// once `timeout` elapses. `None` as timeout waits forever.
    fn wait_any(&self, objects: &[&dyn Waitable], timeout: Option<Duration>) -> Option<usize>;
}

/// Fixed name suffixes of the shared objects of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    InitRequest,
    InitResponse,
    FrameBuff,
    FrameBuffStatus,
    FrameQueue,
    BitstreamBuff,
    BitstreamInfo,
    FilledBitstream,
    StopRequest,
    SpsPpsSizes,
    SpsBuff,
    PpsBuff,
}

impl Endpoint {
    pub fn suffix(&self) -> &'static str {
        match self {
            Endpoint::InitRequest => "_init_request",
            Endpoint::InitResponse => "_init_response",
            Endpoint::FrameBuff => "_frame_buff",
            Endpoint::FrameBuffStatus => "_frame_buff_status",
            Endpoint::FrameQueue => "_frame_queue",
            Endpoint::BitstreamBuff => "_bitstream_buff",
            Endpoint::BitstreamInfo => "_bitstream_info",
            Endpoint::FilledBitstream => "_filled_bitstream",
            Endpoint::StopRequest => "_stop_request",
            Endpoint::SpsPpsSizes => "_spspps_sizes",
            Endpoint::SpsBuff => "_sps_buff",
            Endpoint::PpsBuff => "_pps_buff",
        }
    }
}

/// Executable name used to derive the per-session prefix.
pub const HELPER_NAME: &str = "QSVHelper.exe";

/// Session-unique name prefix, derived from the helper's process identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn for_helper(helper: &dyn HelperProcess) -> Self {
        Self::new(&format!("{}{}", HELPER_NAME, helper.pid()))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.prefix, endpoint.suffix())
    }
}

/// [`HelperProcess`] over a spawned [`std::process::Child`].
pub struct ChildProcess {
    pid: u32,
    child: Mutex<std::process::Child>,
}

impl ChildProcess {
    pub fn new(child: std::process::Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }
}

impl HelperProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn state(&self) -> ProcessState {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(poisoned) => poisoned.into_inner(),
        };
        match child.try_wait() {
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Ok(None) => ProcessState::Running,
            Err(e) => {
                log::error!("failed to query helper process {}: {}", self.pid, e);
                ProcessState::Exited(None)
            }
        }
    }

    fn waitable(&self) -> &dyn Waitable {
        self
    }
}

impl Waitable for ChildProcess {
    fn poll(&self) -> bool {
        self.state() != ProcessState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_names() {
        let ns = Namespace::new("QSVHelper.exe42");
        assert_eq!(ns.name(Endpoint::InitRequest), "QSVHelper.exe42_init_request");
        assert_eq!(ns.name(Endpoint::SpsBuff), "QSVHelper.exe42_sps_buff");
        assert_ne!(ns.name(Endpoint::FrameBuff), ns.name(Endpoint::FrameBuffStatus));
    }

    #[test]
    fn test_child_process_exit() -> anyhow::Result<()> {
        let child = match std::process::Command::new("sh").arg("-c").arg("exit 3").spawn() {
            Ok(child) => child,
            Err(e) => {
                eprintln!("skip: sh not available: {}", e);
                return Ok(());
            }
        };
        let process = ChildProcess::new(child);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !process.waitable().poll() {
            assert!(std::time::Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(process.state(), ProcessState::Exited(Some(3)));
        Ok(())
    }
}
