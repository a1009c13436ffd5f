//! Decrypted-traffic capture: per-connection synthetic TCP sessions
//! funneled into one rotating pcap/pcapng writer.

mod synth;
mod writer;

pub use synth::CaptureSession;
pub use writer::{run_rotation, CaptureWriter};
