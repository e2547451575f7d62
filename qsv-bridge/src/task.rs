use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::demux::EncodedFrame;
use crate::error::EncoderError;
use crate::pool::{FrameSlotRef, Plane};
use crate::session::{FrameInput, Session};

pub type RawFrameSender = tokio::sync::broadcast::Sender<RawFrameCmd>;
pub type RawFrameReceiver = tokio::sync::broadcast::Receiver<RawFrameCmd>;
pub type EncodedFrameSender = tokio::sync::broadcast::Sender<EncodedFrameCmd>;
pub type EncodedFrameReceiver = tokio::sync::broadcast::Receiver<EncodedFrameCmd>;
pub type EncodedFrameStream = Pin<Box<dyn Stream<Item = Option<EncodedFrame>> + Send>>;

/// An uncompressed picture, one buffer per plane.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub luma: Bytes,
    pub chroma: Bytes,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub enum RawFrameCmd {
    Data(RawFrame),
    /// Make the next frame an IDR picture.
    Keyframe,
    EOF,
}

#[derive(Debug, Clone)]
pub enum EncodedFrameCmd {
    /// Decoder configuration record, sent once before any data.
    Header(Bytes),
    Data(EncodedFrame),
    EOF,
}

/// Runs a [`Session`] on a blocking worker fed from a broadcast channel.
pub struct EncoderTask {
    cancel: CancellationToken,
    out_chan: EncodedFrameSender,
}

impl Default for EncoderTask {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderTask {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        /// Encoded packets are small, moderate capacity for bursts.
        const PACKET_CHAN_CAP: usize = 64;
        let (sender, _) = tokio::sync::broadcast::channel(PACKET_CHAN_CAP);

        Self {
            cancel,
            out_chan: sender,
        }
    }

    pub fn subscribe(&self) -> EncodedFrameReceiver {
        self.out_chan.subscribe()
    }

    /// Encoded frames as a stream; `None` marks the end of the session.
    pub fn frame_stream(&self) -> EncodedFrameStream {
        let stream = BroadcastStream::new(self.subscribe()).filter_map(|r| async move {
            match r {
                Ok(EncodedFrameCmd::Data(frame)) => Some(Some(frame)),
                Ok(EncodedFrameCmd::EOF) => Some(None),
                Ok(EncodedFrameCmd::Header(_)) => None,
                Err(e) => {
                    log::warn!("encoded frame stream lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn start(&self, session: Session, mut frame_receiver: RawFrameReceiver) {
        let cancel_clone = self.cancel.clone();
        let sender_clone = self.out_chan.clone();
        log::info!("encoder loop started, {}", session.namespace().prefix());
        /// Bounded queue: when the helper is slower than the producer, frames are dropped instead of queued without limit.
        const FRAME_QUEUE_BOUND: usize = 128;
        /// Log "queue full" at most every N drops.
        const DROP_LOG_INTERVAL: u64 = 120;
        tokio::spawn(async move {
            let (tx, rx) = std::sync::mpsc::sync_channel::<RawFrameCmd>(FRAME_QUEUE_BOUND);
            let handle_cancel = cancel_clone.clone();
            let handle = tokio::task::spawn_blocking(move || {
                Self::encoder_loop(session, handle_cancel, rx, sender_clone)
            });
            let mut dropped_count: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    cmd = frame_receiver.recv() => {
                        let cmd = match cmd {
                            Ok(cmd) => cmd,
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("encoder input lagged, skipped {} frames", n);
                                continue;
                            }
                            Err(RecvError::Closed) => RawFrameCmd::EOF,
                        };
                        let ok = match cmd {
                            RawFrameCmd::Data(_) => match tx.try_send(cmd) {
                                Ok(()) => true,
                                Err(std::sync::mpsc::TrySendError::Full(_)) => {
                                    dropped_count += 1;
                                    if dropped_count % DROP_LOG_INTERVAL == 1 {
                                        log::debug!(
                                            "encoder frame queue full, dropped {} frames (back-pressure)",
                                            dropped_count
                                        );
                                    }
                                    true
                                }
                                Err(std::sync::mpsc::TrySendError::Disconnected(_)) => false,
                            },
                            RawFrameCmd::EOF => {
                                let _ = tx.send(cmd);
                                false
                            }
                            RawFrameCmd::Keyframe => tx.send(cmd).is_ok(),
                        };
                        if !ok {
                            break;
                        }
                    }
                }
            }
            let _ = handle.await;
            log::info!("encoder task finished");
        });
    }

    fn encoder_loop(
        mut session: Session,
        cancel: CancellationToken,
        rx: std::sync::mpsc::Receiver<RawFrameCmd>,
        out: EncodedFrameSender,
    ) {
        /// How long to wait for frames still held by the helper after EOF.
        const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

        match session.headers() {
            Ok(header) => {
                let _ = out.send(EncodedFrameCmd::Header(header));
            }
            Err(e) => {
                log::error!("failed to read encoder headers: {:#}", e);
                let _ = out.send(EncodedFrameCmd::EOF);
                return;
            }
        }

        let mut slot: Option<FrameSlotRef> = None;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let result = match rx.recv_timeout(Duration::from_millis(1)) {
                Ok(RawFrameCmd::Data(frame)) => Self::encode_frame(&mut session, &mut slot, frame),
                Ok(RawFrameCmd::Keyframe) => {
                    session.request_keyframe();
                    Ok(Vec::new())
                }
                Ok(RawFrameCmd::EOF) => {
                    Self::flush(&mut session, &out, FLUSH_TIMEOUT);
                    break;
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => session.encode(None),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            };

            match result {
                Ok(frames) => {
                    for frame in frames {
                        let _ = out.send(EncodedFrameCmd::Data(frame));
                    }
                }
                Err(e) if e.downcast_ref::<EncoderError>().is_some() => {
                    log::error!("encoder session failed: {:#}", e);
                    break;
                }
                Err(e) => log::warn!("failed to encode frame: {:#}", e),
            }
        }

        log::info!(
            "end of encode loop, {} frames still in flight",
            session.in_flight()
        );
        let _ = out.send(EncodedFrameCmd::EOF);
    }

    fn encode_frame(
        session: &mut Session,
        slot: &mut Option<FrameSlotRef>,
        frame: RawFrame,
    ) -> anyhow::Result<Vec<EncodedFrame>> {
        *slot = session.acquire_frame(*slot);
        let bound = slot.ok_or_else(|| anyhow::anyhow!("no frame slot available"))?;
        session.write_plane(bound, Plane::Luma, &frame.luma)?;
        session.write_plane(bound, Plane::Chroma, &frame.chroma)?;
        session.encode(Some(FrameInput {
            slot: bound,
            timestamp_ms: frame.timestamp_ms,
        }))
    }

    fn flush(session: &mut Session, out: &EncodedFrameSender, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while session.in_flight() > 0 && Instant::now() < deadline {
            match session.encode(None) {
                Ok(frames) => {
                    for frame in frames {
                        let _ = out.send(EncodedFrameCmd::Data(frame));
                    }
                }
                Err(e) => {
                    log::error!("flush failed: {:#}", e);
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EncoderSettings;
    use crate::local::LocalTransport;
    use crate::platform::CpuPlatform;
    use crate::sim::{SimOptions, SimulatedHelper};

    fn open() -> anyhow::Result<(SimulatedHelper, Session)> {
        let transport = LocalTransport::new();
        let sim = SimulatedHelper::spawn(transport.clone(), SimOptions::default());
        let settings = EncoderSettings {
            width: 64,
            height: 32,
            ..Default::default()
        };
        let session = Session::open(
            Arc::new(transport),
            sim.process(),
            &settings,
            CpuPlatform::Unknown,
        )?;
        Ok((sim, session))
    }

    fn raw(n: i64) -> RawFrame {
        RawFrame {
            luma: Bytes::from(vec![0x10; 64 * 32]),
            chroma: Bytes::from(vec![0x80; 64 * 16]),
            timestamp_ms: n * 40,
        }
    }

    #[tokio::test]
    async fn test_encoder_task_round_trip() -> anyhow::Result<()> {
        let (_sim, session) = open()?;
        let task = EncoderTask::new();
        let mut out = task.subscribe();
        let (tx, _) = tokio::sync::broadcast::channel(16);
        task.start(session, tx.subscribe()).await;

        for n in 0..5 {
            tx.send(RawFrameCmd::Data(raw(n)))?;
        }
        tx.send(RawFrameCmd::EOF)?;

        let mut header = None;
        let mut frames = Vec::new();
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            while let Ok(cmd) = out.recv().await {
                match cmd {
                    EncodedFrameCmd::Header(h) => header = Some(h),
                    EncodedFrameCmd::Data(frame) => frames.push(frame),
                    EncodedFrameCmd::EOF => break,
                }
            }
        })
        .await?;

        let header = header.expect("header before data");
        assert_eq!(header[0], 0x17);
        assert_eq!(frames.len(), 5);
        assert!(frames[0].keyframe);
        let pts: Vec<i64> = frames.iter().map(|f| f.pts).collect();
        assert_eq!(pts, vec![0, 40, 80, 120, 160]);
        Ok(())
    }

    #[tokio::test]
    async fn test_frame_stream_ends_on_stop() -> anyhow::Result<()> {
        let (_sim, session) = open()?;
        let task = EncoderTask::new();
        let mut stream = task.frame_stream();
        let (tx, _) = tokio::sync::broadcast::channel::<RawFrameCmd>(16);
        task.start(session, tx.subscribe()).await;

        tx.send(RawFrameCmd::Keyframe)?;
        tx.send(RawFrameCmd::Data(raw(0)))?;
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next()).await?;
        let frame = first.flatten().expect("first frame");
        assert!(frame.keyframe);

        task.stop();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next()).await?;
        assert!(matches!(end, Some(None)));
        Ok(())
    }
}
