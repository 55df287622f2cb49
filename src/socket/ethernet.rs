use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use packed_struct::prelude::*;
use packed_struct::types::bits::ByteArray;
use super::EthercatSocket;


/// ethernet type field reserved for ethercat
const ETHERCAT_TYPE: u16 = 0x88a4;
/// byte size of the 802.3 header
const HEADER: usize = 14;
/// an 802.3 frame carries at most 1500 payload bytes
const MAX_PAYLOAD: usize = 1500;
/// frames shorter than the 802.3 minimum are padded up to it
const MIN_FRAME: usize = 60;

/**
    ethercat directly over 802.3 frames, the normal medium for one segment

    [std::net] offers no packet socket, so it is opened through libc, as
    `smoltcp` and `ethercrab` do. This is unix-specific, and binding a packet
    socket needs `CAP_NET_RAW` (or root) on linux: a runtime precondition of
    the embedding program, not something this crate can grant.
*/
#[derive(Debug)]
pub struct EthernetSocket {
    fd: RawFd,
    /// packed 802.3 header stamped on every outgoing frame
    header: [u8; HEADER],
    filter_address: bool,
}

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        let header = master_header()?;

        // non-blocking, the link above owns the timeout policy
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETHERCAT_TYPE.to_be() as i32,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        // from here on an early return drops the socket and closes the fd
        let socket = Self { fd, header, filter_address: true };

        let binding = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETHERCAT_TYPE.to_be(),
            sll_ifindex: interface_index(socket.fd, interface)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        let status = unsafe {
            libc::bind(
                socket.fd,
                &binding as *const libc::sockaddr_ll as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if status == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }

    /// if enabled, incoming frames whose header is not ours are skipped
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<usize> {
        let mut packet = [0_u8; HEADER + MAX_PAYLOAD];
        loop {
            let received = unsafe {
                libc::read(
                    self.fd,
                    packet.as_mut_ptr() as *mut libc::c_void,
                    packet.len(),
                )
            };
            if received < 0 {
                break Err(io::Error::last_os_error());
            }
            let packet = &packet[.. received as usize];
            if packet.len() < HEADER {
                continue;
            }
            // our frames come back with the header untouched, anything else
            // is foreign traffic on the interface
            let ours = match self.filter_address {
                true => packet[.. HEADER] == self.header,
                false => packet[12 .. HEADER] == self.header[12 .. HEADER],
            };
            if !ours {
                continue;
            }
            let content = &packet[HEADER ..];
            let length = content.len().min(data.len());
            data[.. length].copy_from_slice(&content[.. length]);
            break Ok(length);
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_PAYLOAD {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds the ethernet payload"));
        }
        // the buffer is pre-zeroed, so sending up to the 802.3 minimum pads
        // short frames for free
        let mut packet = [0_u8; HEADER + MAX_PAYLOAD];
        packet[.. HEADER].copy_from_slice(&self.header);
        packet[HEADER ..][.. data.len()].copy_from_slice(data);
        let length = (HEADER + data.len()).max(MIN_FRAME);

        let sent = unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                length,
            )
        };
        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn max_frame(&self) -> usize {
        MAX_PAYLOAD
    }
}

/**
    the header stamped on every frame this master emits

    MAC addresses carry no meaning on an ethercat segment: the frame visits
    every slave whatever they say. The destination is simply the broadcast
    address, and the source has its locally-administered bit set so a frame
    coming back through the processing units still compares equal to what was
    sent.
*/
fn master_header() -> io::Result<[u8; HEADER]> {
    let header = EthernetHeader {
        dst: [0xff; 6],
        src: [0x02, 0xe7, 0xb5, 0x00, 0x00, 0x01],
        protocol: ETHERCAT_TYPE,
    };
    let packed = header.pack()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cannot pack the ethernet header"))?;
    let mut image = [0; HEADER];
    image.copy_from_slice(packed.as_bytes_slice());
    Ok(image)
}

/// resolve the index of a network interface, needed to bind a packet socket
/// onto it
fn interface_index(fd: RawFd, interface: &str) -> io::Result<libc::c_int> {
    // the relevant prefix of the C ifreq structure
    #[repr(C)]
    struct Request {
        name: [libc::c_char; libc::IF_NAMESIZE],
        index: libc::c_int,
    }

    if interface.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    let mut request = Request {
        name: [0; libc::IF_NAMESIZE],
        index: 0,
    };
    for (slot, byte) in request.name.iter_mut().zip(interface.bytes()) {
        *slot = byte as libc::c_char;
    }

    let status = unsafe {
        libc::ioctl(fd, libc::SIOCGIFINDEX, &mut request as *mut Request)
    };
    if status == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(request.index)
}

/// 802.3 frame header, big-endian on the wire
#[derive(PackedStruct, Clone, Debug, Eq, PartialEq)]
#[packed_struct(size_bytes="14", bit_numbering="lsb0", endian="msb")]
struct EthernetHeader {
    #[packed_field(bytes="8:13")] dst: [u8; 6],
    #[packed_field(bytes="2:7")] src: [u8; 6],
    /// frame type, always [ETHERCAT_TYPE] here
    #[packed_field(bytes="0:1")] protocol: u16,
}
