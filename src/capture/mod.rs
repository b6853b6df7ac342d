//! Frame transport
//!
//! Abstraction over the raw-socket backend that delivers Ethernet frames
//! to the router and carries its responses.

mod af_packet;

pub use af_packet::AfPacketSocket;

use crate::Result;
use std::future::Future;

/// Frame transport backend.
pub trait Capture: Send {
    /// Receive one frame into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Send one frame. The buffer is not mutated.
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send;
}
