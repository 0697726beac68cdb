mod cancel;
mod close_gate;
mod monitor;
mod read_buffer;

#[doc(inline)]
pub use cancel::Cancel;
#[doc(inline)]
pub use close_gate::CloseGate;
#[doc(inline)]
pub use monitor::{Monitor, MonitorInfo};
#[doc(inline)]
pub use read_buffer::ReadBuffer;
