//! Host side of an out-of-process hardware H.264 encoder.
//!
//! The encoder itself runs in a helper process. This crate negotiates a
//! session with it, hands raw frames over through shared memory and turns the
//! returned bitstreams into container-ready packets.

pub mod config;
pub mod demux;
pub mod dts;
pub mod error;
pub mod ipc;
pub mod local;
pub mod mapped;
pub mod nal;
pub mod negotiate;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod task;

pub use config::EncoderSettings;
pub use demux::EncodedFrame;
pub use error::{EncoderError, ExitReason};
pub use platform::CpuPlatform;
pub use session::{FrameInput, Session, SessionInfo};
pub use task::{EncodedFrameCmd, EncoderTask, RawFrame, RawFrameCmd};
