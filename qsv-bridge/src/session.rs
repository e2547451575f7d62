//! One encoder session: negotiation results, both slot pools, the submission
//! scheduler and the demux/DTS state.
//!
//! All calls happen on one thread. The only blocking point is the completion
//! drain, entered when every bitstream slot is in flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use crate::config::EncoderSettings;
use crate::demux::{DecoderConfig, Demuxer, EncodedFrame};
use crate::dts::DtsGenerator;
use crate::error::EncoderError;
use crate::ipc::{Endpoint, HelperProcess, Namespace, ProcessState, SharedRegion, Signal, Transport};
use crate::negotiate::{Negotiated, negotiate};
use crate::platform::CpuPlatform;
use crate::pool::{BitstreamPool, FrameLayout, FramePool, FrameSlotRef, Plane};
use crate::protocol::{
    BitstreamInfo, NO_BITSTREAM, QueuedFrame, Record, SpsPpsSizes, Version, implementation,
    ticks_from_ms,
};

/// A frame ready for submission: a bound frame slot and its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInput {
    pub slot: FrameSlotRef,
    pub timestamp_ms: i64,
}

/// Human readable summary of the negotiated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: Version,
    pub implementation: u32,
    pub target_usage: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub use_cbr: bool,
    pub use_cfr: bool,
    pub max_bitrate: u32,
    /// kbit, only meaningful without CBR
    pub buffer_size: u32,
    pub bitstream_num: u32,
    pub frame_num: u32,
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Video Encoding: QSV {} ({})\n    fps: {}\n    width: {}, height: {}\n    target-usage: {}\n    CBR: {}\n    CFR: {}\n    max bitrate: {}",
            self.version,
            implementation::describe(self.implementation),
            self.fps,
            self.width,
            self.height,
            implementation::describe_target_usage(self.target_usage),
            yes_no(self.use_cbr),
            yes_no(self.use_cfr),
            self.max_bitrate
        )?;
        if !self.use_cbr {
            write!(f, "\n    buffer size: {}", self.buffer_size)?;
        }
        Ok(())
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    helper: Arc<dyn HelperProcess>,
    namespace: Namespace,
    negotiated: Negotiated,
    info: SessionInfo,
    frames: FramePool,
    bitstreams: BitstreamPool,
    frame_queue: Arc<dyn SharedRegion>,
    queue_signal: Arc<dyn Signal>,
    filled: Arc<dyn SharedRegion>,
    filled_signal: Arc<dyn Signal>,
    stop: Arc<dyn Signal>,
    dts: DtsGenerator,
    demuxer: Demuxer,
    headers: DecoderConfig,
    request_keyframe: bool,
}

impl Session {
    /// Negotiates with `helper` and maps every shared object of the session.
    pub fn open(
        transport: Arc<dyn Transport>,
        helper: Arc<dyn HelperProcess>,
        settings: &EncoderSettings,
        platform: CpuPlatform,
    ) -> Result<Self> {
        platform.check_resolution(settings.width, settings.height)?;

        let namespace = Namespace::for_helper(helper.as_ref());
        let request = settings.to_request(std::process::id());
        let negotiated = negotiate(transport.as_ref(), &namespace, helper.as_ref(), &request)?;
        let response = &negotiated.response;

        let frame_layout = negotiated.frame_layout()?;
        let bitstream_layout = negotiated.bitstream_layout()?;
        let frame_num = frame_layout.slots().count();
        let t = transport.as_ref();

        let frames = FramePool::new(
            frame_layout,
            t.open_region(
                &namespace.name(Endpoint::FrameBuff),
                frame_layout.slots().region_len(),
            )?,
            t.open_region(&namespace.name(Endpoint::FrameBuffStatus), frame_num * 4)?,
        )?;
        let bitstreams = BitstreamPool::new(
            bitstream_layout,
            t.open_region(
                &namespace.name(Endpoint::BitstreamBuff),
                bitstream_layout.region_len(),
            )?,
            t.open_region(
                &namespace.name(Endpoint::BitstreamInfo),
                bitstream_layout.count() * BitstreamInfo::SIZE,
            )?,
        )?;

        let info = SessionInfo {
            version: response.version,
            implementation: response.actual_impl,
            target_usage: response.target_usage,
            fps: settings.fps,
            width: settings.width,
            height: settings.height,
            use_cbr: settings.use_cbr,
            use_cfr: settings.use_cfr,
            max_bitrate: settings.max_bitrate,
            buffer_size: (response.bitstream_size as u64 * 8 / 1000) as u32,
            bitstream_num: response.bitstream_num,
            frame_num: response.frame_num,
        };
        log::info!("{}", info);

        let dts = DtsGenerator::new(
            response.bframe_delay,
            response.version,
            settings.use_cfr,
            response.frame_ticks,
            platform,
        );

        let mut session = Self {
            frame_queue: t.open_region(
                &namespace.name(Endpoint::FrameQueue),
                frame_num * QueuedFrame::SIZE,
            )?,
            queue_signal: t.open_signal(&namespace.name(Endpoint::FrameQueue))?,
            filled: t.open_region(&namespace.name(Endpoint::FilledBitstream), 4)?,
            filled_signal: t.open_signal(&namespace.name(Endpoint::FilledBitstream))?,
            stop: t.open_signal(&namespace.name(Endpoint::StopRequest))?,
            info,
            frames,
            bitstreams,
            dts,
            demuxer: Demuxer::new(),
            headers: DecoderConfig::default(),
            request_keyframe: false,
            negotiated,
            namespace,
            transport,
            helper,
        };
        session.headers()?;
        Ok(session)
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn frame_layout(&self) -> &FrameLayout {
        self.frames.layout()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn in_flight(&self) -> usize {
        self.bitstreams.queues().in_flight_len()
    }

    pub fn acquire_frame(&mut self, existing: Option<FrameSlotRef>) -> Option<FrameSlotRef> {
        self.frames.acquire_frame(existing)
    }

    pub fn write_plane(&self, slot: FrameSlotRef, plane: Plane, data: &[u8]) -> Result<()> {
        self.frames.write_plane(slot, plane, data)
    }

    pub fn frame_ref_count(&self, slot: FrameSlotRef) -> u32 {
        self.frames.ref_count(slot)
    }

    /// The next submitted frame asks the helper for an IDR picture.
    pub fn request_keyframe(&mut self) {
        self.request_keyframe = true;
    }

    /// Decoder configuration record. Read from the helper once, cached after.
    pub fn headers(&mut self) -> Result<Bytes> {
        let transport = self.transport.as_ref();
        let helper = self.helper.as_ref();
        let namespace = &self.namespace;
        let negotiated = &self.negotiated;
        self.headers
            .get_or_build(|| read_headers(transport, namespace, helper, negotiated))
    }

    /// Latest unregistered user data SEI, length-prefixed.
    pub fn sei(&self) -> Bytes {
        self.demuxer.sei()
    }

    /// Submits `input` if a bitstream slot is free and drains completions.
    /// With every slot in flight the call blocks until one completes, then
    /// submits. `None` only collects what is already finished.
    pub fn encode(&mut self, input: Option<FrameInput>) -> Result<Vec<EncodedFrame>> {
        self.check_helper()?;

        let mut out = Vec::new();
        let Some(input) = input else {
            while self.bitstreams.queues().in_flight_len() > 0 {
                match self.drain(Some(Duration::ZERO))? {
                    Some(frame) => out.push(frame),
                    None => break,
                }
            }
            return Ok(out);
        };

        let queued = self.bitstreams.queues().has_idle();
        if queued {
            self.submit(input)?;
        }

        loop {
            let idle = self.bitstreams.queues().has_idle();
            let timeout = if idle { Some(Duration::ZERO) } else { None };
            if let Some(frame) = self.drain(timeout)? {
                out.push(frame);
            }
            if idle || self.bitstreams.queues().has_idle() {
                break;
            }
        }

        if !queued {
            self.submit(input)?;
        }
        Ok(out)
    }

    fn helper_exited(&self, code: Option<i32>) -> anyhow::Error {
        let reason = self.negotiated.exit_reason(code);
        log::error!("{} has exited: {}", self.namespace.prefix(), reason);
        EncoderError::HelperExited(reason).into()
    }

    fn check_helper(&self) -> Result<()> {
        match self.helper.state() {
            ProcessState::Running => Ok(()),
            ProcessState::Exited(code) => Err(self.helper_exited(code)),
        }
    }

    fn submit(&mut self, input: FrameInput) -> Result<()> {
        if !self.frames.is_assigned(input.slot) {
            anyhow::bail!("frame slot {} is not bound", input.slot.index());
        }
        let Some(task) = self.bitstreams.queues().idle_head() else {
            anyhow::bail!("no idle bitstream slot to submit into");
        };

        let timestamp = ticks_from_ms(input.timestamp_ms);
        let entry = QueuedFrame {
            is_new: true,
            request_keyframe: self.request_keyframe,
            timestamp: timestamp as u64,
            frame_index: input.slot.index() as u32,
        };

        self.frames.mark_in_use(input.slot)?;
        let mut placed = false;
        self.frame_queue.with_locked(&mut |cells| {
            if let Some(cell) = cells
                .chunks_exact_mut(QueuedFrame::SIZE)
                .find(|cell| !QueuedFrame::decode(cell).is_new)
            {
                entry.encode(cell);
                placed = true;
            }
        });
        if !placed {
            log::error!("no free cell in the frame queue of {}", self.namespace.prefix());
            return Err(EncoderError::Saturated.into());
        }

        self.request_keyframe = false;
        self.dts.add(timestamp);
        self.bitstreams.submit(timestamp);
        self.queue_signal.signal();
        log::trace!(
            "submitted frame {} at {} ms into bitstream {}",
            input.slot.index(),
            input.timestamp_ms,
            task
        );
        Ok(())
    }

    /// Waits up to `timeout` for one completion and demuxes it.
    fn drain(&mut self, timeout: Option<Duration>) -> Result<Option<EncodedFrame>> {
        let ready = self.transport.wait_any(
            &[self.helper.waitable(), self.filled_signal.waitable()],
            timeout,
        );
        match ready {
            None => return Ok(None),
            Some(0) => {
                let code = match self.helper.state() {
                    ProcessState::Exited(code) => code,
                    ProcessState::Running => None,
                };
                return Err(self.helper_exited(code));
            }
            Some(_) => {}
        }

        let mut reported = NO_BITSTREAM;
        self.filled.with_locked(&mut |cell| {
            reported = u32::from_le_bytes([cell[0], cell[1], cell[2], cell[3]]);
            cell[..4].copy_from_slice(&NO_BITSTREAM.to_le_bytes());
        });
        let index = self.bitstreams.expect_completion(reported)?;

        // every completion advances the dts engine, even one that is dropped
        let result = match self.bitstreams.read_info(index) {
            Ok(info) => {
                let dts = self.dts.resolve(info.time_stamp as i64, info.decode_time_stamp);
                self.bitstreams
                    .read_payload(index, info)
                    .and_then(|slot| self.demuxer.process(dts, &slot))
            }
            Err(e) => Err(e),
        };
        self.bitstreams.release(index)?;

        match result {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if matches!(
                e.downcast_ref::<EncoderError>(),
                Some(EncoderError::MalformedBitstream(_))
            ) =>
            {
                log::warn!("dropping frame from bitstream {}: {}", index, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("stopping {}", self.namespace.prefix());
        self.stop.signal();
    }
}

/// Waits for the helper to publish SPS and PPS and reads both.
fn read_headers(
    transport: &dyn Transport,
    namespace: &Namespace,
    helper: &dyn HelperProcess,
    negotiated: &Negotiated,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let sizes_name = namespace.name(Endpoint::SpsPpsSizes);
    let sizes_region = transport.open_region(&sizes_name, SpsPpsSizes::SIZE)?;
    let sizes_signal = transport.open_signal(&sizes_name)?;

    match transport.wait_any(&[helper.waitable(), sizes_signal.waitable()], None) {
        Some(1) => {}
        Some(_) => {
            let code = match helper.state() {
                ProcessState::Exited(code) => code,
                ProcessState::Running => None,
            };
            return Err(EncoderError::HelperExited(negotiated.exit_reason(code)).into());
        }
        None => anyhow::bail!("wait for sps/pps returned without a ready object"),
    }

    let sizes = SpsPpsSizes::read_from(sizes_region.as_ref(), 0)?;
    let mut sps = vec![0u8; sizes.sps_size as usize];
    let mut pps = vec![0u8; sizes.pps_size as usize];
    transport
        .open_region(&namespace.name(Endpoint::SpsBuff), sps.len())?
        .read_at(0, &mut sps)?;
    transport
        .open_region(&namespace.name(Endpoint::PpsBuff), pps.len())?
        .read_at(0, &mut pps)?;
    Ok((sps, pps))
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
