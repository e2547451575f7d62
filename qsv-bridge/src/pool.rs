//! Frame and bitstream slot pools over the two shared buffers.
//!
//! Slots are addressed by index only. All offsets come from descriptors built
//! once from the init response and validated against the mapped regions.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};

use crate::error::EncoderError;
use crate::ipc::SharedRegion;
use crate::protocol::{BitstreamInfo, InitResponse, Record};

pub const BITSTREAM_ALIGN: usize = 32;
pub const FRAME_ALIGN: usize = 16;

pub fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

/// `count` equally sized slots, each starting on an `align` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    count: usize,
    size: usize,
    stride: usize,
}

impl SlotLayout {
    pub fn new(count: usize, size: usize, align: usize) -> Result<Self, EncoderError> {
        if count == 0 || size == 0 {
            return Err(EncoderError::Layout(format!(
                "{} slots of {} bytes",
                count, size
            )));
        }
        let stride = align_up(size, align)
            .filter(|stride| stride.checked_mul(count).is_some())
            .ok_or_else(|| {
                EncoderError::Layout(format!("{} slots of {} bytes overflow", count, size))
            })?;
        Ok(Self {
            count,
            size,
            stride,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Usable bytes per slot.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn region_len(&self) -> usize {
        self.stride * self.count
    }

    pub fn slot(&self, index: usize) -> Option<Range<usize>> {
        (index < self.count).then(|| {
            let start = index * self.stride;
            start..start + self.size
        })
    }

    pub fn validate(&self, region: &dyn SharedRegion) -> Result<(), EncoderError> {
        if region.len() < self.region_len() {
            return Err(EncoderError::Layout(format!(
                "region {} has {} bytes, layout needs {}",
                region.name(),
                region.len(),
                self.region_len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Luma,
    /// Interleaved or U chroma plane.
    Chroma,
    /// V plane of planar formats.
    ChromaV,
}

/// Frame slot geometry: slot layout plus plane offsets and row pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    slots: SlotLayout,
    uv_offset: usize,
    v_offset: usize,
    pitch: usize,
}

impl FrameLayout {
    pub fn from_response(resp: &InitResponse) -> Result<Self, EncoderError> {
        let slots = SlotLayout::new(
            resp.frame_num as usize,
            resp.frame_size as usize,
            FRAME_ALIGN,
        )?;
        let uv_offset = resp.uv_offset as usize;
        let v_offset = resp.v_offset as usize;
        if uv_offset == 0 || uv_offset >= slots.size() || v_offset >= slots.size() {
            return Err(EncoderError::Layout(format!(
                "plane offsets uv={} v={} outside frame of {} bytes",
                uv_offset,
                v_offset,
                slots.size()
            )));
        }
        Ok(Self {
            slots,
            uv_offset,
            v_offset,
            pitch: resp.frame_pitch as usize,
        })
    }

    pub fn slots(&self) -> &SlotLayout {
        &self.slots
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Absolute byte range of `plane` within the frame buffer.
    pub fn plane(&self, index: usize, plane: Plane) -> Option<Range<usize>> {
        let slot = self.slots.slot(index)?;
        let range = match plane {
            Plane::Luma => slot.start..slot.start + self.uv_offset,
            Plane::Chroma => slot.start + self.uv_offset..slot.end,
            Plane::ChromaV => slot.start + self.v_offset..slot.end,
        };
        Some(range)
    }
}

/// Opaque handle on a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSlotRef(usize);

impl FrameSlotRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

fn ref_count_at(table: &[u8], index: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&table[index * 4..index * 4 + 4]);
    u32::from_le_bytes(raw)
}

/// Shared image buffers plus the reference-count table the helper decrements.
pub struct FramePool {
    layout: FrameLayout,
    buffer: Arc<dyn SharedRegion>,
    status: Arc<dyn SharedRegion>,
    assigned: Vec<bool>,
}

impl FramePool {
    pub fn new(
        layout: FrameLayout,
        buffer: Arc<dyn SharedRegion>,
        status: Arc<dyn SharedRegion>,
    ) -> Result<Self> {
        layout.slots().validate(buffer.as_ref())?;
        let count = layout.slots().count();
        if status.len() < count * 4 {
            anyhow::bail!(
                "frame status table {} has {} bytes, {} slots need {}",
                status.name(),
                status.len(),
                count,
                count * 4
            );
        }
        Ok(Self {
            layout,
            buffer,
            status,
            assigned: vec![false; count],
        })
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn count(&self) -> usize {
        self.assigned.len()
    }

    /// Binds a free frame slot. An existing binding whose slot is no longer
    /// referenced is returned as is. When every slot is busy the existing
    /// binding comes back unchanged, even if it is absent or still referenced;
    /// callers cannot tell this case apart.
    pub fn acquire_frame(&mut self, existing: Option<FrameSlotRef>) -> Option<FrameSlotRef> {
        let existing = existing.filter(|slot| slot.0 < self.assigned.len());
        let assigned = &mut self.assigned;
        let mut result = existing;
        self.status.with_locked(&mut |table| {
            if let Some(slot) = existing {
                if ref_count_at(table, slot.0) == 0 {
                    return;
                }
            }
            for i in 0..assigned.len() {
                if ref_count_at(table, i) != 0 || assigned[i] {
                    continue;
                }
                if let Some(prev) = existing {
                    assigned[prev.0] = false;
                }
                assigned[i] = true;
                result = Some(FrameSlotRef(i));
                return;
            }
            log::error!("all frames are in use");
        });
        result
    }

    /// Increments the slot's reference count under the table lock.
    pub fn mark_in_use(&self, slot: FrameSlotRef) -> Result<()> {
        if slot.0 >= self.count() {
            anyhow::bail!("frame slot {} out of range", slot.0);
        }
        self.status.with_locked(&mut |table| {
            let count = ref_count_at(table, slot.0).saturating_add(1);
            table[slot.0 * 4..slot.0 * 4 + 4].copy_from_slice(&count.to_le_bytes());
        });
        Ok(())
    }

    pub fn ref_count(&self, slot: FrameSlotRef) -> u32 {
        let mut count = 0;
        self.status.with_locked(&mut |table| {
            if slot.0 * 4 + 4 <= table.len() {
                count = ref_count_at(table, slot.0);
            }
        });
        count
    }

    pub fn is_assigned(&self, slot: FrameSlotRef) -> bool {
        self.assigned.get(slot.0).copied().unwrap_or(false)
    }

    /// Copies image data into one plane of a frame slot.
    pub fn write_plane(&self, slot: FrameSlotRef, plane: Plane, data: &[u8]) -> Result<()> {
        let range = self
            .layout
            .plane(slot.0, plane)
            .ok_or_else(|| anyhow::anyhow!("frame slot {} out of range", slot.0))?;
        if data.len() > range.len() {
            anyhow::bail!(
                "{} bytes do not fit {:?} plane of {} bytes",
                data.len(),
                plane,
                range.len()
            );
        }
        self.buffer.write_at(range.start, data)
    }
}

/// Idle and in-flight bitstream slot indices. Together they always hold every
/// index exactly once; completions must arrive in submission order.
#[derive(Debug, Clone)]
pub struct SlotQueues {
    idle: VecDeque<usize>,
    in_flight: VecDeque<usize>,
}

impl SlotQueues {
    pub fn new(count: usize) -> Self {
        Self {
            idle: (0..count).collect(),
            in_flight: VecDeque::with_capacity(count),
        }
    }

    pub fn idle_head(&self) -> Option<usize> {
        self.idle.front().copied()
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_head(&self) -> Option<usize> {
        self.in_flight.front().copied()
    }

    /// Moves the idle head to the back of the in-flight queue.
    pub fn submit(&mut self) -> Option<usize> {
        let index = self.idle.pop_front()?;
        self.in_flight.push_back(index);
        Some(index)
    }

    /// Checks that `reported` is the next slot due to complete.
    pub fn expect_completion(&self, reported: u32) -> Result<usize, EncoderError> {
        match self.in_flight_head() {
            Some(head) if head as u64 == reported as u64 => Ok(head),
            expected => Err(EncoderError::CompletionOrder {
                expected,
                actual: reported,
            }),
        }
    }

    /// Returns the in-flight head to the idle queue.
    pub fn complete(&mut self, reported: u32) -> Result<usize, EncoderError> {
        let index = self.expect_completion(reported)?;
        self.in_flight.pop_front();
        self.idle.push_back(index);
        Ok(index)
    }

    pub fn is_partition(&self, count: usize) -> bool {
        let mut seen = vec![false; count];
        for &i in self.idle.iter().chain(self.in_flight.iter()) {
            if i >= count || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        seen.into_iter().all(|s| s)
    }
}

/// A bitstream slot the helper has filled.
#[derive(Debug, Clone)]
pub struct CompletedSlot {
    pub index: usize,
    /// Timestamp of the submitted frame, in protocol ticks.
    pub input_timestamp: i64,
    pub info: BitstreamInfo,
    pub data: Bytes,
}

/// Bitstream slots ("tasks") and their metadata table.
pub struct BitstreamPool {
    layout: SlotLayout,
    buffer: Arc<dyn SharedRegion>,
    info: Arc<dyn SharedRegion>,
    timestamps: Vec<i64>,
    queues: SlotQueues,
}

impl BitstreamPool {
    pub fn new(
        layout: SlotLayout,
        buffer: Arc<dyn SharedRegion>,
        info: Arc<dyn SharedRegion>,
    ) -> Result<Self> {
        layout.validate(buffer.as_ref())?;
        let count = layout.count();
        if info.len() < count * BitstreamInfo::SIZE {
            anyhow::bail!(
                "bitstream info table {} too small for {} slots",
                info.name(),
                count
            );
        }
        Ok(Self {
            layout,
            buffer,
            info,
            timestamps: vec![0; count],
            queues: SlotQueues::new(count),
        })
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn queues(&self) -> &SlotQueues {
        &self.queues
    }

    /// Stamps the idle head's task and moves it in flight.
    pub fn submit(&mut self, timestamp: i64) -> Option<usize> {
        let index = self.queues.submit()?;
        self.timestamps[index] = timestamp;
        Some(index)
    }

    pub fn expect_completion(&self, reported: u32) -> Result<usize, EncoderError> {
        self.queues.expect_completion(reported)
    }

    pub fn release(&mut self, index: usize) -> Result<(), EncoderError> {
        self.queues.complete(index as u32).map(|_| ())
    }

    /// Reads the metadata and payload of a filled slot.
    pub fn read_completed(&self, index: usize) -> Result<CompletedSlot> {
        let info = self.read_info(index)?;
        self.read_payload(index, info)
    }

    pub fn read_info(&self, index: usize) -> Result<BitstreamInfo> {
        if index >= self.layout.count() {
            anyhow::bail!("bitstream slot {} out of range", index);
        }
        BitstreamInfo::read_from(self.info.as_ref(), index)
    }

    /// Reads the payload `info` describes. Fails with
    /// [`EncoderError::MalformedBitstream`] when it does not fit the slot.
    pub fn read_payload(&self, index: usize, info: BitstreamInfo) -> Result<CompletedSlot> {
        let slot = self
            .layout
            .slot(index)
            .ok_or_else(|| anyhow::anyhow!("bitstream slot {} out of range", index))?;
        let start = info.data_offset as usize;
        let end = start.saturating_add(info.data_length as usize);
        if end > slot.len() {
            return Err(EncoderError::MalformedBitstream(format!(
                "slot {} reports bytes {}..{} of {}",
                index,
                start,
                end,
                slot.len()
            ))
            .into());
        }
        let mut data = BytesMut::zeroed(end - start);
        self.buffer.read_at(slot.start + start, &mut data)?;
        Ok(CompletedSlot {
            index,
            input_timestamp: self.timestamps[index],
            info,
            data: data.freeze(),
        })
    }
}
