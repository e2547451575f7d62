//! Init handshake with the helper process.
//!
//! The request is published once and the host blocks until the helper either
//! answers or exits. There is no timeout: a helper that does neither hangs
//! the caller.

use anyhow::Result;

use crate::error::{EncoderError, ExitReason};
use crate::ipc::{Endpoint, HelperProcess, Namespace, ProcessState, Transport};
use crate::pool::{BITSTREAM_ALIGN, FrameLayout, SlotLayout};
use crate::protocol::{InitRequest, InitResponse, Record, RequestMode, implementation};

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub response: InitResponse,
    /// Whether the request carried an implementation override.
    pub override_requested: bool,
}

impl Negotiated {
    pub fn frame_layout(&self) -> Result<FrameLayout, EncoderError> {
        FrameLayout::from_response(&self.response)
    }

    pub fn bitstream_layout(&self) -> Result<SlotLayout, EncoderError> {
        SlotLayout::new(
            self.response.bitstream_num as usize,
            self.response.bitstream_size as usize,
            BITSTREAM_ALIGN,
        )
    }

    pub fn exit_reason(&self, code: Option<i32>) -> ExitReason {
        ExitReason::from_exit_code(code, self.override_requested)
    }
}

fn exit_code(helper: &dyn HelperProcess) -> Option<i32> {
    match helper.state() {
        ProcessState::Exited(code) => code,
        ProcessState::Running => None,
    }
}

fn publish_request(
    transport: &dyn Transport,
    namespace: &Namespace,
    request: &InitRequest,
) -> Result<()> {
    let name = namespace.name(Endpoint::InitRequest);
    let region = transport.open_region(&name, InitRequest::SIZE)?;
    request.write_to(region.as_ref(), 0)?;
    transport.open_signal(&name)?.signal();
    Ok(())
}

/// Sends `request` and waits for the init response or helper exit.
pub fn negotiate(
    transport: &dyn Transport,
    namespace: &Namespace,
    helper: &dyn HelperProcess,
    request: &InitRequest,
) -> Result<Negotiated> {
    let override_requested = request.custom_impl.is_some();
    let response_name = namespace.name(Endpoint::InitResponse);
    let response_region = transport.open_region(&response_name, InitResponse::SIZE)?;
    let response_signal = transport.open_signal(&response_name)?;

    publish_request(transport, namespace, request)?;

    match transport.wait_any(&[helper.waitable(), response_signal.waitable()], None) {
        Some(1) => {}
        Some(_) => {
            let reason = ExitReason::from_exit_code(exit_code(helper), override_requested);
            log::error!("{} has exited before the init response: {}", namespace.prefix(), reason);
            return Err(EncoderError::Negotiation(reason).into());
        }
        None => anyhow::bail!("wait for the init response returned without a ready object"),
    }

    let response = InitResponse::read_from(response_region.as_ref(), 0)?;

    if override_requested && !response.using_custom_impl {
        log::warn!("could not initialize the QSV session using the custom implementation");
    }
    log::info!(
        "QSV version {} using {} (actual: {})",
        response.version,
        implementation::describe(response.requested_impl),
        implementation::describe(response.actual_impl)
    );
    log::info!(
        "using {} bitstreams and {} frame buffers",
        response.bitstream_num,
        response.frame_num
    );

    Ok(Negotiated {
        response,
        override_requested,
    })
}

/// Asks the helper whether hardware encoding is available. The helper answers
/// by exiting, code 0 meaning supported.
pub fn probe(
    transport: &dyn Transport,
    namespace: &Namespace,
    helper: &dyn HelperProcess,
) -> Result<bool> {
    let request = InitRequest {
        mode: RequestMode::Query,
        host_process_id: std::process::id(),
        ..Default::default()
    };
    publish_request(transport, namespace, &request)?;

    if transport.wait_any(&[helper.waitable()], None).is_none() {
        anyhow::bail!("wait for the helper to exit returned without a ready object");
    }
    let code = exit_code(helper);
    log::debug!("hardware probe exited with {:?}", code);
    Ok(code == Some(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderSettings;
    use crate::error::EXIT_NO_VALID_CONFIGURATION;
    use crate::local::LocalTransport;
    use crate::protocol::{ImplOverride, Version};
    use crate::sim::{SimOptions, SimulatedHelper};

    fn request(custom: bool) -> InitRequest {
        let mut request = EncoderSettings::default().to_request(1);
        if custom {
            request.custom_impl = Some(ImplOverride {
                implementation: implementation::HARDWARE_ANY,
                interface: implementation::VIA_D3D11,
                version: Version::new(1, 6),
            });
        }
        request
    }

    #[test]
    fn test_negotiate_reads_response() -> Result<()> {
        let transport = LocalTransport::new();
        let options = SimOptions::default();
        let expected = options.response.clone();
        let sim = SimulatedHelper::spawn(transport.clone(), options);
        let process = sim.process();
        let namespace = Namespace::for_helper(&*process);

        let negotiated = negotiate(&transport, &namespace, &*process, &request(false))?;
        assert_eq!(negotiated.response, expected);
        assert!(!negotiated.override_requested);
        assert_eq!(
            negotiated.bitstream_layout()?.count(),
            expected.bitstream_num as usize
        );
        let received = sim.received_request().expect("request seen by helper");
        assert_eq!(received.mode, RequestMode::Encode);
        Ok(())
    }

    #[test]
    fn test_negotiate_reports_exit_code() {
        for (code, custom, reason) in [
            (1, true, ExitReason::IncompatibleOverride),
            (1, false, ExitReason::NotInitialized),
            (EXIT_NO_VALID_CONFIGURATION, false, ExitReason::NoValidConfiguration),
            (9, false, ExitReason::Code(9)),
        ] {
            let transport = LocalTransport::new();
            let sim = SimulatedHelper::spawn(
                transport.clone(),
                SimOptions {
                    exit_before_response: Some(code),
                    ..Default::default()
                },
            );
            let process = sim.process();
            let namespace = Namespace::for_helper(&*process);
            let err = negotiate(&transport, &namespace, &*process, &request(custom)).unwrap_err();
            match err.downcast_ref::<EncoderError>() {
                Some(EncoderError::Negotiation(r)) => assert_eq!(r, &reason),
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_probe() -> Result<()> {
        for supported in [true, false] {
            let transport = LocalTransport::new();
            let sim = SimulatedHelper::spawn(
                transport.clone(),
                SimOptions {
                    supported,
                    ..Default::default()
                },
            );
            let process = sim.process();
            let namespace = Namespace::for_helper(&*process);
            assert_eq!(probe(&transport, &namespace, &*process)?, supported);
        }
        Ok(())
    }
}
