//! Packet capture input for logprof
//!
//! Turns a pcap or pcapng file into HTTP transaction records:
//!
//! 1. **source**: capture file format detection and frame reading
//! 2. **packet**: link/IP/TCP decoding of captured frames
//! 3. **reassembly**: per-flow TCP byte stream reconstruction
//! 4. **classify**: request/response side detection against the server set
//! 5. **pipeline**: half-stream workers, the conjoiner and [`PcapParser`]

pub mod classify;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod reassembly;
pub mod source;
pub mod tracker;

pub use classify::ServerSet;
pub use error::{CaptureError, CaptureResult};
pub use packet::{decode_frame, Flow, TcpSegment};
pub use pipeline::{PcapOptions, PcapParser, PipelineConfig};
pub use reassembly::{Reassembler, ReassemblyLimits, StreamSink};
pub use source::{CaptureReader, Frame};
pub use tracker::{WorkerGuard, WorkerTracker};
