//! Simulated encoder helper, usually on top of [`LocalTransport`].
//!
//! Speaks the helper side of the protocol with synthetic H.264: an access unit
//! delimiter and one slice per frame, IDR on the first frame and on request.
//! Used by the tests and by the demo binary where no hardware helper exists.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::ipc::{Endpoint, Namespace, SharedRegion, Signal, Transport};
use crate::local::{LocalProcess, LocalTransport};
use crate::pool::{BITSTREAM_ALIGN, FrameLayout, SlotLayout};
use crate::protocol::{
    BitstreamInfo, InitRequest, InitResponse, NO_BITSTREAM, QueuedFrame, Record, RequestMode,
    SpsPpsSizes, Version, frame_type, implementation,
};

const IDLE_WAIT: Duration = Duration::from_millis(10);

pub const SIM_SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40];
pub const SIM_PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0];

const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];
const IDR_SLICE: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21, 0xa0];
const P_SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x2c];
/// User data unregistered SEI with a 16 byte uuid and 4 bytes of payload.
const USER_DATA_SEI: &[u8] = &[
    0, 0, 0, 1, 0x06, 0x05, 0x14, 0xdc, 0x45, 0xe9, 0xbd, 0xe6, 0xd9, 0x48, 0xb7, 0x96, 0x2c,
    0xd8, 0x20, 0xd9, 0x23, 0xee, 0xef, 0x71, 0x73, 0x76, 0x21, 0x80,
];

/// SEI whose declared payload runs past the end of the unit.
const TRUNCATED_SEI: &[u8] = &[0, 0, 0, 1, 0x06, 0x05, 0x10, 0x01, 0x02];

/// Ways a completed frame can be damaged on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The payload carries an unterminated user data SEI.
    TruncatedSei,
    /// The metadata points past the end of the bitstream slot.
    OffsetOutOfRange,
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Sent back verbatim, except for `using_custom_impl`.
    pub response: InitResponse,
    /// Whether a query-mode request exits with code 0.
    pub supported: bool,
    pub honor_override: bool,
    /// Exit with this code instead of answering the init request.
    pub exit_before_response: Option<i32>,
    /// Frames held before the oldest one completes.
    pub hold_until: usize,
    /// Complete the first two frames in reverse order.
    pub swap_first_pair: bool,
    /// Never consume the frame queue.
    pub stall: bool,
    /// Exit with `.1` after `.0` completions.
    pub exit_after: Option<(usize, i32)>,
    /// Damage the n-th completion (0-based).
    pub corrupt: Vec<(usize, Corruption)>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            response: InitResponse {
                version: Version::new(1, 6),
                requested_impl: implementation::HARDWARE | implementation::VIA_D3D11,
                actual_impl: implementation::HARDWARE | implementation::VIA_D3D11,
                target_usage: 4,
                bitstream_num: 4,
                bitstream_size: 4096,
                frame_num: 6,
                frame_size: 64 * 32 * 3 / 2,
                uv_offset: 64 * 32,
                v_offset: 64 * 32 + 1,
                frame_pitch: 64,
                bframe_delay: 0,
                frame_ticks: 3000,
                using_custom_impl: false,
            },
            supported: true,
            honor_override: true,
            exit_before_response: None,
            hold_until: 1,
            swap_first_pair: false,
            stall: false,
            exit_after: None,
            corrupt: Vec::new(),
        }
    }
}

/// What the helper saw, shared with the spawning side.
#[derive(Default)]
struct SimState {
    request: Mutex<Option<InitRequest>>,
    max_outstanding: AtomicUsize,
    completed: AtomicUsize,
}

pub struct SimulatedHelper {
    transport: Arc<dyn Transport>,
    process: Arc<LocalProcess>,
    namespace: Namespace,
    state: Arc<SimState>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedHelper {
    pub fn spawn(transport: LocalTransport, options: SimOptions) -> Self {
        let process = transport.spawn_process();
        Self::spawn_on(Arc::new(transport), process, options)
    }

    /// Runs the helper over any transport, e.g. one shared with another
    /// process. `process` stands in for the helper's process handle.
    pub fn spawn_on(
        transport: Arc<dyn Transport>,
        process: Arc<LocalProcess>,
        options: SimOptions,
    ) -> Self {
        let namespace = Namespace::for_helper(&*process);
        let state = Arc::new(SimState::default());

        let worker = Worker {
            transport: transport.clone(),
            process: process.clone(),
            namespace: namespace.clone(),
            state: state.clone(),
            options,
        };
        let handle = std::thread::spawn(move || {
            let process = worker.process.clone();
            match worker.run() {
                Ok(code) => process.exit(code),
                Err(e) => {
                    log::error!("simulated helper failed: {:#}", e);
                    process.exit(-1);
                }
            }
        });

        Self {
            transport,
            process,
            namespace,
            state,
            handle: Some(handle),
        }
    }

    pub fn process(&self) -> Arc<LocalProcess> {
        self.process.clone()
    }

    pub fn received_request(&self) -> Option<InitRequest> {
        self.state
            .request
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Most frames the helper ever held at once.
    pub fn max_outstanding(&self) -> usize {
        self.state.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if let Ok(stop) = self.transport.open_signal(&self.namespace.name(Endpoint::StopRequest)) {
            stop.signal();
        }
    }
}

impl Drop for SimulatedHelper {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Pending {
    bitstream: usize,
    frame: QueuedFrame,
}

struct Worker {
    transport: Arc<dyn Transport>,
    process: Arc<LocalProcess>,
    namespace: Namespace,
    state: Arc<SimState>,
    options: SimOptions,
}

struct Channels {
    queue: Arc<dyn SharedRegion>,
    queue_signal: Arc<dyn Signal>,
    status: Arc<dyn SharedRegion>,
    bitstream: Arc<dyn SharedRegion>,
    info: Arc<dyn SharedRegion>,
    filled: Arc<dyn SharedRegion>,
    filled_signal: Arc<dyn Signal>,
    stop: Arc<dyn Signal>,
    layout: SlotLayout,
}

impl Worker {
    fn name(&self, endpoint: Endpoint) -> String {
        self.namespace.name(endpoint)
    }

    /// Returns the exit code of the helper.
    fn run(self) -> Result<i32> {
        let request_name = self.name(Endpoint::InitRequest);
        let request_region = self.transport.open_region(&request_name, InitRequest::SIZE)?;
        let request_signal = self.transport.open_signal(&request_name)?;
        let stop = self.transport.open_signal(&self.name(Endpoint::StopRequest))?;

        match self
            .transport
            .wait_any(&[request_signal.waitable(), stop.waitable()], None)
        {
            Some(0) => {}
            _ => return Ok(0),
        }
        let request = InitRequest::read_from(request_region.as_ref(), 0)?;
        if let Ok(mut seen) = self.state.request.lock() {
            *seen = Some(request.clone());
        }

        if request.mode == RequestMode::Query {
            return Ok(if self.options.supported { 0 } else { 1 });
        }
        if let Some(code) = self.options.exit_before_response {
            return Ok(code);
        }

        let mut response = self.options.response.clone();
        response.using_custom_impl = request.custom_impl.is_some() && self.options.honor_override;
        let response_name = self.name(Endpoint::InitResponse);
        response.write_to(
            self.transport
                .open_region(&response_name, InitResponse::SIZE)?
                .as_ref(),
            0,
        )?;
        self.transport.open_signal(&response_name)?.signal();

        self.publish_headers()?;
        let channels = self.open_channels(&response)?;
        self.encode_loop(&channels, &response)
    }

    fn publish_headers(&self) -> Result<()> {
        let sizes_name = self.name(Endpoint::SpsPpsSizes);
        self.transport
            .open_region(&self.name(Endpoint::SpsBuff), SIM_SPS.len())?
            .write_at(0, SIM_SPS)?;
        self.transport
            .open_region(&self.name(Endpoint::PpsBuff), SIM_PPS.len())?
            .write_at(0, SIM_PPS)?;
        SpsPpsSizes {
            sps_size: SIM_SPS.len() as u32,
            pps_size: SIM_PPS.len() as u32,
        }
        .write_to(
            self.transport
                .open_region(&sizes_name, SpsPpsSizes::SIZE)?
                .as_ref(),
            0,
        )?;
        self.transport.open_signal(&sizes_name)?.signal();
        Ok(())
    }

    fn open_channels(&self, response: &InitResponse) -> Result<Channels> {
        let frames = FrameLayout::from_response(response)?;
        let layout = SlotLayout::new(
            response.bitstream_num as usize,
            response.bitstream_size as usize,
            BITSTREAM_ALIGN,
        )?;
        let frame_num = frames.slots().count();
        let t = &self.transport;
        Ok(Channels {
            queue: t.open_region(&self.name(Endpoint::FrameQueue), frame_num * QueuedFrame::SIZE)?,
            queue_signal: t.open_signal(&self.name(Endpoint::FrameQueue))?,
            status: t.open_region(&self.name(Endpoint::FrameBuffStatus), frame_num * 4)?,
            bitstream: t.open_region(&self.name(Endpoint::BitstreamBuff), layout.region_len())?,
            info: t.open_region(
                &self.name(Endpoint::BitstreamInfo),
                layout.count() * BitstreamInfo::SIZE,
            )?,
            filled: t.open_region(&self.name(Endpoint::FilledBitstream), 4)?,
            filled_signal: t.open_signal(&self.name(Endpoint::FilledBitstream))?,
            stop: t.open_signal(&self.name(Endpoint::StopRequest))?,
            layout,
        })
    }

    fn encode_loop(&self, ch: &Channels, response: &InitResponse) -> Result<i32> {
        let bitstream_num = response.bitstream_num as usize;
        let hold = self.options.hold_until.max(1);
        let mut pending: VecDeque<Pending> = VecDeque::new();
        let mut next_bitstream = 0;
        let mut completions = 0;
        let mut first_fill = true;

        loop {
            match self.transport.wait_any(
                &[ch.queue_signal.waitable(), ch.stop.waitable()],
                Some(IDLE_WAIT),
            ) {
                Some(1) => return Ok(0),
                Some(_) if !self.options.stall => {}
                _ => continue,
            }

            for frame in take_new_frames(ch) {
                pending.push_back(Pending {
                    bitstream: next_bitstream,
                    frame,
                });
                next_bitstream = (next_bitstream + 1) % bitstream_num;
                self.state
                    .max_outstanding
                    .fetch_max(pending.len(), Ordering::SeqCst);

                while pending.len() >= hold {
                    let swap = self.options.swap_first_pair && completions == 0;
                    let pick = if swap && pending.len() > 1 { 1 } else { 0 };
                    let Some(done) = pending.remove(pick) else {
                        break;
                    };
                    if !self.complete(ch, &done, completions, &mut first_fill)? {
                        return Ok(0);
                    }
                    completions += 1;
                    if let Some((after, code)) = self.options.exit_after {
                        if completions >= after {
                            return Ok(code);
                        }
                    }
                }
            }
        }
    }

    /// Writes one finished frame and signals it. Returns false when a stop
    /// request arrives while the host still holds the previous index.
    fn complete(
        &self,
        ch: &Channels,
        done: &Pending,
        completion: usize,
        first_fill: &mut bool,
    ) -> Result<bool> {
        let keyframe = completion == 0 || done.frame.request_keyframe;
        let corruption = self
            .options
            .corrupt
            .iter()
            .find(|(n, _)| *n == completion)
            .map(|(_, c)| *c);
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(AUD);
        if corruption == Some(Corruption::TruncatedSei) {
            data.extend_from_slice(TRUNCATED_SEI);
        }
        if keyframe {
            data.extend_from_slice(USER_DATA_SEI);
            data.extend_from_slice(IDR_SLICE);
        } else {
            data.extend_from_slice(P_SLICE);
        }
        let flags = if keyframe {
            frame_type::I | frame_type::REF | frame_type::IDR
        } else {
            frame_type::P | frame_type::REF
        };

        let Some(slot) = ch.layout.slot(done.bitstream) else {
            anyhow::bail!("bitstream {} outside the layout", done.bitstream);
        };
        ch.bitstream.write_at(slot.start, &data)?;
        let data_offset = match corruption {
            Some(Corruption::OffsetOutOfRange) => slot.len() as u32,
            _ => 0,
        };
        BitstreamInfo {
            time_stamp: done.frame.timestamp,
            decode_time_stamp: done.frame.timestamp as i64,
            data_length: data.len() as u32,
            data_offset,
            pic_struct: 1,
            frame_type: flags,
        }
        .write_to(ch.info.as_ref(), done.bitstream)?;

        loop {
            let mut written = false;
            let fill = *first_fill;
            ch.filled.with_locked(&mut |cell| {
                let current = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
                if fill || current == NO_BITSTREAM {
                    cell[..4].copy_from_slice(&(done.bitstream as u32).to_le_bytes());
                    written = true;
                }
            });
            if written {
                *first_fill = false;
                break;
            }
            if ch.stop.waitable().poll() {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.state.completed.fetch_add(1, Ordering::SeqCst);
        ch.filled_signal.signal();
        Ok(true)
    }
}

/// Consumes every occupied queue cell in index order and drops the frame's
/// reference.
fn take_new_frames(ch: &Channels) -> Vec<QueuedFrame> {
    let mut taken = Vec::new();
    ch.queue.with_locked(&mut |cells| {
        for cell in cells.chunks_exact_mut(QueuedFrame::SIZE) {
            let frame = QueuedFrame::decode(cell);
            if frame.is_new {
                QueuedFrame::default().encode(cell);
                taken.push(frame);
            }
        }
    });
    ch.status.with_locked(&mut |table| {
        for frame in &taken {
            let at = frame.frame_index as usize * 4;
            if let Some(raw) = table.get_mut(at..at + 4) {
                let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                raw.copy_from_slice(&count.saturating_sub(1).to_le_bytes());
            }
        }
    });
    taken
}
