use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use super::EthercatSocket;

/// fixed port of ethercat over UDP, per ETG.1000.4
const ETHERCAT_PORT: u16 = 0x88a4;

/**
    UDP socket with fixed port, allowing ethercat communication through a
    regular switch

    Masters and slaves are IP-addressed, so there can be any number of masters
    and slaves on the network.
*/
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddr,
    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported and the port is fixed,
    /// hence this function only requires the segment address
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddr::new(IpAddr::V4(segment), ETHERCAT_PORT);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ETHERCAT_PORT,
        ))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            address,
            filter_address: true,
        })
    }

    /// if enabled, incoming packets from a wrong host are ignored
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<usize> {
        loop {
            let (size, src) = self.socket.recv_from(data)?;
            if self.filter_address && self.address != src {
                continue;
            }
            break Ok(size);
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.address)?;
        Ok(())
    }

    fn max_frame(&self) -> usize {
        1500 // max ethernet payload in 802.3
        - 20 // IP header
        - 8  // UDP header
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
