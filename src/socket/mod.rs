mod ethernet;
mod udp;

pub use ethernet::EthernetSocket;
pub use udp::UdpSocket;

use std::io;

/**
    trait implementing the ethercat frame encapsulation into some medium

    According to ETG.1000.4 only raw ethernet and UDP are officially supported.
    Implementations must be non-blocking: [Self::receive] returns
    [io::ErrorKind::WouldBlock] when no frame is pending, so the caller owns the
    timeout policy.
*/
pub trait EthercatSocket {
    /// receive one whole ethercat frame into the given buffer, without its
    /// medium encapsulation
    fn receive(&self, data: &mut [u8]) -> io::Result<usize>;
    /// send one whole ethercat frame
    fn send(&self, data: &[u8]) -> io::Result<()>;
    /// biggest ethercat frame the medium can carry
    fn max_frame(&self) -> usize;
}
