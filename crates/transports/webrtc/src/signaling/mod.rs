//! Signaling: the messages endpoints exchange and the relay that carries them
//!
//! Three message kinds cross the relay: the offer, the answer, and ICE
//! candidates. Ordering is preserved within one endpoint's outbound stream;
//! nothing is promised across endpoints.

mod protocol;
mod relay;

pub use protocol::{Envelope, SignalingMessage};
pub use relay::{InProcessRelay, SignalingRelay};
