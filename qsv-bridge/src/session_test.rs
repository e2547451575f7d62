use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::EncoderSettings;
use crate::demux::{EncodedFrame, build_decoder_config};
use crate::error::{EncoderError, ExitReason};
use crate::ipc::{Endpoint, HelperProcess, ProcessState, Transport};
use crate::local::LocalTransport;
use crate::mapped::{MappedTransport, scratch_dir};
use crate::platform::CpuPlatform;
use crate::pool::{FrameSlotRef, Plane};
use crate::session::{FrameInput, Session};
use crate::protocol::Version;
use crate::sim::{Corruption, SIM_PPS, SIM_SPS, SimOptions, SimulatedHelper};

const FRAME_MS: i64 = 33;

fn settings() -> EncoderSettings {
    EncoderSettings {
        width: 64,
        height: 32,
        ..Default::default()
    }
}

fn start(options: SimOptions) -> Result<(LocalTransport, SimulatedHelper, Session)> {
    start_with(&settings(), options)
}

fn start_with(
    settings: &EncoderSettings,
    options: SimOptions,
) -> Result<(LocalTransport, SimulatedHelper, Session)> {
    let transport = LocalTransport::new();
    let sim = SimulatedHelper::spawn(transport.clone(), options);
    let session = Session::open(
        Arc::new(transport.clone()),
        sim.process(),
        settings,
        CpuPlatform::Unknown,
    )?;
    Ok((transport, sim, session))
}

/// Binds a slot, fills its luma plane and submits it.
fn feed_one(
    session: &mut Session,
    slot: &mut Option<FrameSlotRef>,
    n: usize,
) -> Result<Vec<EncodedFrame>> {
    *slot = session.acquire_frame(*slot);
    let bound = slot.ok_or_else(|| anyhow::anyhow!("no frame slot for frame {}", n))?;
    session.write_plane(bound, Plane::Luma, &[n as u8; 64])?;
    session.encode(Some(FrameInput {
        slot: bound,
        timestamp_ms: n as i64 * FRAME_MS,
    }))
}

fn feed(session: &mut Session, count: usize) -> Result<Vec<EncodedFrame>> {
    let mut out = Vec::new();
    let mut slot = None;
    for n in 0..count {
        out.extend(feed_one(session, &mut slot, n)?);
    }
    Ok(out)
}

/// Polls finished frames until `out` holds `want` of them.
fn collect(session: &mut Session, out: &mut Vec<EncodedFrame>, want: usize) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while out.len() < want {
        out.extend(session.encode(None)?);
        if Instant::now() > deadline {
            anyhow::bail!("timed out with {} of {} frames", out.len(), want);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Feeds frames, then polls, until the session fails.
fn run_until_error(session: &mut Session, frames: usize) -> anyhow::Error {
    let mut slot = None;
    for n in 0..frames {
        if let Err(e) = feed_one(session, &mut slot, n) {
            return e;
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Err(e) = session.encode(None) {
            return e;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    anyhow::anyhow!("session kept running")
}

#[test]
fn test_encode_happy_path() -> Result<()> {
    let (_transport, sim, mut session) = start(SimOptions::default())?;

    let mut out = feed(&mut session, 10)?;
    collect(&mut session, &mut out, 10)?;

    assert_eq!(out.len(), 10);
    assert_eq!(sim.completed(), 10);
    for (n, frame) in out.iter().enumerate() {
        assert_eq!(frame.pts, n as i64 * FRAME_MS);
        assert_eq!(frame.input_pts, n as i64 * FRAME_MS);
        assert_eq!(frame.dts, n as i64 * FRAME_MS);
        assert_eq!(frame.composition_offset, 0);
        let packet = frame.packet.as_ref().expect("frame packet");
        assert_eq!(packet[0], if n == 0 { 0x17 } else { 0x27 });
    }
    assert!(out[0].keyframe);
    assert!(out[1..].iter().all(|f| !f.keyframe));

    let sei = session.sei();
    assert_eq!(&sei[..4], &[0, 0, 0, 21]);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn test_malformed_frames_dropped_without_dts_drift() -> Result<()> {
    let settings = EncoderSettings {
        use_cfr: false,
        ..settings()
    };
    let (_transport, sim, mut session) = start_with(
        &settings,
        SimOptions {
            corrupt: vec![
                (3, Corruption::TruncatedSei),
                (6, Corruption::OffsetOutOfRange),
            ],
            ..Default::default()
        },
    )?;

    let mut out = feed(&mut session, 10)?;
    collect(&mut session, &mut out, 8)?;

    let pts: Vec<i64> = out.iter().map(|f| f.pts).collect();
    let expected: Vec<i64> = [0, 1, 2, 4, 5, 7, 8, 9]
        .iter()
        .map(|n| n * FRAME_MS)
        .collect();
    assert_eq!(pts, expected);
    // rebuilt from submissions: each frame decodes at its predecessor's timestamp
    for frame in &out[1..] {
        assert_eq!(frame.dts, frame.pts - FRAME_MS, "frame at {} ms", frame.pts);
    }
    assert!(out[1..].windows(2).all(|w| w[0].dts < w[1].dts));
    assert!(out.iter().all(|f| f.composition_offset >= 0));
    assert_eq!(sim.completed(), 10);
    assert_eq!(session.in_flight(), 0);
    Ok(())
}

#[test]
fn test_reorder_window_before_protocol_1_6() -> Result<()> {
    let mut options = SimOptions {
        hold_until: 2,
        ..Default::default()
    };
    options.response.version = Version::new(1, 3);
    options.response.bframe_delay = 1;
    let (_transport, _sim, mut session) = start(options)?;

    let mut out = feed(&mut session, 10)?;
    // the helper keeps the last frame
    collect(&mut session, &mut out, 9)?;

    let dts: Vec<i64> = out.iter().map(|f| f.dts).collect();
    let mut expected = vec![0, FRAME_MS];
    expected.extend((2..9).map(|n| (n - 1) * FRAME_MS));
    assert_eq!(dts, expected);
    assert!(out.iter().all(|f| f.dts <= f.pts));
    assert_eq!(out[2].composition_offset, 2 * FRAME_MS);
    Ok(())
}

#[test]
fn test_frame_references_released_by_helper() -> Result<()> {
    let (_transport, _sim, mut session) = start(SimOptions::default())?;
    let slot = session.acquire_frame(None).expect("free frame slot");
    let mut out = session.encode(Some(FrameInput {
        slot,
        timestamp_ms: 0,
    }))?;
    collect(&mut session, &mut out, 1)?;
    assert_eq!(session.frame_ref_count(slot), 0);
    // unreferenced binding is reused
    assert_eq!(session.acquire_frame(Some(slot)), Some(slot));
    Ok(())
}

#[test]
fn test_backpressure_window() -> Result<()> {
    for hold in [1, 3, 4] {
        let (_transport, sim, mut session) = start(SimOptions {
            hold_until: hold,
            ..Default::default()
        })?;
        let bitstreams = session.info().bitstream_num as usize;

        let mut out = feed(&mut session, 24)?;
        collect(&mut session, &mut out, 24 - (hold - 1))?;

        assert!(
            sim.max_outstanding() <= hold.min(bitstreams),
            "hold {} saw {} outstanding",
            hold,
            sim.max_outstanding()
        );
        assert!(session.in_flight() <= bitstreams);
        let pts: Vec<i64> = out.iter().map(|f| f.pts).collect();
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
    }
    Ok(())
}

#[test]
fn test_keyframe_request() -> Result<()> {
    let (_transport, _sim, mut session) = start(SimOptions::default())?;
    let mut slot = None;
    let mut out = Vec::new();
    for n in 0..3 {
        out.extend(feed_one(&mut session, &mut slot, n)?);
    }
    collect(&mut session, &mut out, 3)?;

    session.request_keyframe();
    out.extend(feed_one(&mut session, &mut slot, 3)?);
    out.extend(feed_one(&mut session, &mut slot, 4)?);
    collect(&mut session, &mut out, 5)?;

    let keyframes: Vec<bool> = out.iter().map(|f| f.keyframe).collect();
    assert_eq!(keyframes, vec![true, false, false, true, false]);
    Ok(())
}

#[test]
fn test_headers_cached() -> Result<()> {
    let (transport, _sim, mut session) = start(SimOptions::default())?;
    let expected = build_decoder_config(SIM_SPS, SIM_PPS)?;
    assert_eq!(session.headers()?, expected);
    assert_eq!(expected.len(), 16 + SIM_SPS.len() - 4 + SIM_PPS.len() - 4);

    // later changes on the helper side are not picked up
    let sps_name = session.namespace().name(Endpoint::SpsBuff);
    transport
        .open_region(&sps_name, SIM_SPS.len())?
        .write_at(4, &[0x67, 0x4d])?;
    assert_eq!(session.headers()?, expected);
    Ok(())
}

#[test]
fn test_out_of_order_completion_is_fatal() -> Result<()> {
    let (_transport, _sim, mut session) = start(SimOptions {
        hold_until: 2,
        swap_first_pair: true,
        ..Default::default()
    })?;
    let err = run_until_error(&mut session, 3);
    match err.downcast_ref::<EncoderError>() {
        Some(EncoderError::CompletionOrder { expected, actual }) => {
            assert_eq!(*expected, Some(0));
            assert_eq!(*actual, 1);
        }
        other => panic!("unexpected error {:?}: {:#}", other, err),
    }
    Ok(())
}

#[test]
fn test_helper_exit_mid_session() -> Result<()> {
    let (_transport, _sim, mut session) = start(SimOptions {
        exit_after: Some((3, 5)),
        ..Default::default()
    })?;
    let err = run_until_error(&mut session, 16);
    match err.downcast_ref::<EncoderError>() {
        Some(EncoderError::HelperExited(reason)) => assert_eq!(reason, &ExitReason::Code(5)),
        other => panic!("unexpected error {:?}: {:#}", other, err),
    }
    Ok(())
}

#[test]
fn test_saturated_frame_queue() -> Result<()> {
    let mut options = SimOptions {
        stall: true,
        ..Default::default()
    };
    options.response.frame_num = 2;
    let (_transport, _sim, mut session) = start(options)?;

    let err = run_until_error(&mut session, 3);
    assert!(
        matches!(
            err.downcast_ref::<EncoderError>(),
            Some(EncoderError::Saturated)
        ),
        "unexpected error {:#}",
        err
    );
    Ok(())
}

#[test]
fn test_open_fails_on_helper_exit() {
    let transport = LocalTransport::new();
    let sim = SimulatedHelper::spawn(
        transport.clone(),
        SimOptions {
            exit_before_response: Some(crate::error::EXIT_NO_VALID_CONFIGURATION),
            ..Default::default()
        },
    );
    let err = Session::open(
        Arc::new(transport),
        sim.process(),
        &settings(),
        CpuPlatform::Haswell,
    )
    .err()
    .expect("open must fail");
    assert!(matches!(
        err.downcast_ref::<EncoderError>(),
        Some(EncoderError::Negotiation(ExitReason::NoValidConfiguration))
    ));
}

#[test]
fn test_resolution_rejected_before_handshake() {
    let transport = LocalTransport::new();
    let sim = SimulatedHelper::spawn(transport.clone(), SimOptions::default());
    let settings = EncoderSettings {
        width: 2560,
        height: 1440,
        ..Default::default()
    };
    let err = Session::open(
        Arc::new(transport),
        sim.process(),
        &settings,
        CpuPlatform::IvyBridge,
    )
    .err()
    .expect("open must fail");
    assert!(matches!(
        err.downcast_ref::<EncoderError>(),
        Some(EncoderError::ResolutionUnsupported {
            width: 2560,
            height: 1440
        })
    ));
    assert!(sim.received_request().is_none());
}

#[test]
fn test_info_display() -> Result<()> {
    let (_transport, _sim, session) = start(SimOptions::default())?;
    let text = session.info().to_string();
    assert!(text.contains("fps: 30"));
    assert!(text.contains("width: 64, height: 32"));
    assert!(text.contains("MFX_TARGETUSAGE_BALANCED"));
    assert!(text.contains("CBR: yes"));
    assert!(!text.contains("buffer size"));

    let mut info = session.info().clone();
    info.use_cbr = false;
    assert!(info.to_string().contains("buffer size: 32"));
    Ok(())
}

#[test]
fn test_drop_stops_helper() -> Result<()> {
    let (_transport, sim, session) = start(SimOptions::default())?;
    let process = sim.process();
    drop(session);

    let deadline = Instant::now() + Duration::from_secs(5);
    while process.state() == ProcessState::Running {
        assert!(Instant::now() < deadline, "helper still running");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(process.state(), ProcessState::Exited(Some(0)));
    Ok(())
}

#[test]
fn test_session_over_mapped_files() -> Result<()> {
    let dir = scratch_dir("session");
    let host = Arc::new(MappedTransport::new(&dir)?);
    // the helper maps the same files through its own transport
    let sim = SimulatedHelper::spawn_on(
        Arc::new(MappedTransport::new(&dir)?),
        LocalTransport::new().spawn_process(),
        SimOptions::default(),
    );
    let mut session = Session::open(
        host.clone(),
        sim.process(),
        &settings(),
        CpuPlatform::Unknown,
    )?;

    let mut out = feed(&mut session, 5)?;
    collect(&mut session, &mut out, 5)?;
    let pts: Vec<i64> = out.iter().map(|f| f.pts).collect();
    assert_eq!(pts, (0..5).map(|n| n * FRAME_MS).collect::<Vec<_>>());
    assert!(out[0].keyframe);
    assert_eq!(session.headers()?, build_decoder_config(SIM_SPS, SIM_PPS)?);
    assert_eq!(session.in_flight(), 0);

    let prefix = session.namespace().prefix().to_string();
    drop(session);
    drop(sim);
    assert!(host.remove_objects(&prefix)? > 0);
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
