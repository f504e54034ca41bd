#![doc = "Stimulation/monitoring engine: two processes, one rendezvous, buffered device I/O."]

pub mod device;
pub mod gate;
pub mod reader;
pub mod session;
pub mod shared;
pub mod signals;
pub mod simulated;
pub mod writer;

pub use device::*;
pub use gate::*;
pub use reader::*;
pub use session::*;
pub use shared::*;
pub use simulated::*;
pub use writer::*;
