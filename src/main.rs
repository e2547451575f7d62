use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use qsv_bridge::ipc::{ChildProcess, HelperProcess, Namespace, Transport};
use qsv_bridge::local::LocalTransport;
use qsv_bridge::mapped::{MappedTransport, OBJECT_DIR_ENV};
use qsv_bridge::negotiate::probe;
use qsv_bridge::pool::Plane;
use qsv_bridge::sim::{SimOptions, SimulatedHelper};
use qsv_bridge::{EncodedFrameCmd, EncoderTask, RawFrame, RawFrameCmd, Session};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::{HelperConfig, HostConfig};

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => HostConfig::load(Path::new(&path))?,
        None => HostConfig::default(),
    };
    let platform = config.platform();
    log::info!("cpu platform: {:?}", platform);

    let mut sim = None;
    let mut mapped = None;
    let (transport, process): (Arc<dyn Transport>, Arc<dyn HelperProcess>) = match &config.helper
    {
        Some(helper) => {
            let objects = Arc::new(MappedTransport::new(helper.object_dir())?);
            log::info!("helper objects under {}", objects.dir().display());
            if config.probe {
                let process = spawn_helper(helper, objects.dir())?;
                let available = check_hardware(objects.as_ref(), process.as_ref());
                objects.remove_objects(Namespace::for_helper(process.as_ref()).prefix())?;
                available?;
            }
            let process = spawn_helper(helper, objects.dir())?;
            let transport: Arc<dyn Transport> = objects.clone();
            mapped = Some((objects, Namespace::for_helper(process.as_ref())));
            (transport, process)
        }
        None => {
            let local = LocalTransport::new();
            if config.probe {
                let helper = SimulatedHelper::spawn(local.clone(), SimOptions::default());
                check_hardware(&local, helper.process().as_ref())?;
            }
            let helper = SimulatedHelper::spawn(local.clone(), SimOptions::default());
            let process: Arc<dyn HelperProcess> = helper.process();
            let transport: Arc<dyn Transport> = Arc::new(local);
            sim = Some(helper);
            (transport, process)
        }
    };

    let session = Session::open(transport, process, &config.encoder, platform)?;

    let layout = session.frame_layout();
    let luma_len = layout.plane(0, Plane::Luma).map(|r| r.len()).unwrap_or(0);
    let chroma_len = layout.plane(0, Plane::Chroma).map(|r| r.len()).unwrap_or(0);

    let task = EncoderTask::new();
    let mut packets = task.subscribe();
    let (raw_tx, raw_rx) = tokio::sync::broadcast::channel(64);
    task.start(session, raw_rx).await;

    let cancel = CancellationToken::new();
    let producer_cancel = cancel.clone();
    let fps = config.encoder.fps.max(1) as u64;
    let frames = config.frames as u64;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis((1000 / fps).max(1)));
        for n in 0..frames {
            tokio::select! {
                _ = producer_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let frame = RawFrame {
                luma: Bytes::from(vec![(n % 256) as u8; luma_len]),
                chroma: Bytes::from(vec![0x80; chroma_len]),
                timestamp_ms: (n * 1000 / fps) as i64,
            };
            let _ = raw_tx.send(RawFrameCmd::Data(frame));
        }
        let _ = raw_tx.send(RawFrameCmd::EOF);
    });

    let mut count = 0usize;
    let mut bytes = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                task.stop();
            },
            cmd = packets.recv() => match cmd {
                Ok(EncodedFrameCmd::Header(header)) => {
                    log::info!("decoder configuration: {} bytes", header.len());
                }
                Ok(EncodedFrameCmd::Data(frame)) => {
                    let len = frame.packet.as_ref().map(|p| p.len()).unwrap_or(0);
                    log::debug!(
                        "packet pts {} dts {} keyframe {} priority {:?} {} bytes",
                        frame.pts,
                        frame.dts,
                        frame.keyframe,
                        frame.priority,
                        len
                    );
                    count += 1;
                    bytes += len;
                }
                Ok(EncodedFrameCmd::EOF) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => log::warn!("packet receiver lagged by {}", n),
            },
        }
    }

    log::info!("encoded {} frames, {} bytes", count, bytes);
    drop(sim);
    if let Some((objects, namespace)) = mapped {
        objects.remove_objects(namespace.prefix())?;
    }
    Ok(())
}

fn spawn_helper(helper: &HelperConfig, dir: &Path) -> anyhow::Result<Arc<dyn HelperProcess>> {
    let child = std::process::Command::new(&helper.path)
        .args(&helper.args)
        .env(OBJECT_DIR_ENV, dir)
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to start {}: {}", helper.path.display(), e))?;
    log::info!("started {} as pid {}", helper.path.display(), child.id());
    Ok(Arc::new(ChildProcess::new(child)))
}

/// Runs a query-mode handshake against a throwaway helper.
fn check_hardware(transport: &dyn Transport, process: &dyn HelperProcess) -> anyhow::Result<()> {
    let namespace = Namespace::for_helper(process);
    if !probe(transport, &namespace, process)? {
        anyhow::bail!("hardware encoding is not available");
    }
    Ok(())
}
