/*!
    codec for ethercat frames: the frame header followed by datagrams, each
    datagram carrying its own header, payload and working counter

    A [Frame] instance is reused for its whole life: datagrams are packed into
    its buffer, the wire image is sent, and the reply image received in place is
    consumed in packing order.
*/

use crate::data::{bilge_pdudata, bilge_pdudata_wide, Cursor, PduData};
use crate::error::{EthercatError, EthercatResult};
use bilge::prelude::*;


/// maximum number of datagrams one frame may carry
pub const MAX_DATAGRAMS: usize = 15;
/// byte budget of a whole ethercat frame, bounded by the ethernet payload
pub const MAX_FRAME: usize = 1500;
/// bytes taken by one datagram besides its payload
pub const DATAGRAM_OVERHEAD: usize = DatagramHeader::PACKED_SIZE + WKC_SIZE;

const HEADER_SIZE: usize = EthercatHeader::PACKED_SIZE;
const WKC_SIZE: usize = 2;

/// compose a datagram address from a slave designation (topological position or
/// station address, depending on the command) and a register address
pub const fn pdu_address(slave: u16, register: u16) -> u32 {
    (register as u32) << 16 | slave as u32
}

/// header starting every ethercat frame
/// ETG.1000.4 table 14
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct EthercatHeader {
    /// byte length of the content following this header
    pub length: u11,
    reserved: u1,
    pub ty: EthercatType,
}
bilge_pdudata!(EthercatHeader, u16);

/// type of content of an ethercat frame
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EthercatType {
    /// process or physical-memory exchange, the only type used by this master
    Pdu = 0x1,
    NetworkVariable = 0x4,
    Mailbox = 0x5,
}

/// the possible datagram commands
#[bitsize(8)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PduCommand {
    /// no operation
    Nop = 0x00,

    /// auto-incremented (topological) read
    Aprd = 0x01,
    /// auto-incremented write
    Apwr = 0x02,
    /// auto-incremented read & write
    Aprw = 0x03,

    /// station-addressed read
    Fprd = 0x04,
    /// station-addressed write
    Fpwr = 0x05,
    /// station-addressed read & write
    Fprw = 0x06,

    /// broadcast read
    Brd = 0x07,
    /// broadcast write
    Bwr = 0x08,
    /// broadcast read & write
    Brw = 0x09,

    /// logical memory read
    Lrd = 0x0a,
    /// logical memory write
    Lwr = 0x0b,
    /// logical memory read & write
    Lrw = 0x0c,

    /// auto-incremented read & multiple write
    Armw = 0x0d,
    /// station-addressed read & multiple write
    Frmw = 0x0e,
}

/// header starting every datagram in a frame
/// ETG.1000.4 table 15
#[bitsize(80)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct DatagramHeader {
    pub command: PduCommand,
    /// opaque correlator assigned by the master and copied back by the slaves
    pub index: u8,
    /// composed address, see [pdu_address]
    pub address: u32,
    /// byte length of the payload
    pub length: u11,
    reserved: u3,
    /// set by a slave when the datagram already circulated once
    pub circulating: bool,
    /// another datagram follows in the same frame
    pub multiple: bool,
    /// event requests latched by the slaves
    pub irq: u16,
}
bilge_pdudata_wide!(DatagramHeader, u80, u128, 10);

/**
    one reusable ethercat frame

    In write mode datagrams are appended with [Self::add_datagram] until
    [Self::finish] seals the frame header and yields the wire image. Once the
    reply image has been stored back by [Self::received], the reply datagrams
    are popped in packing order with [Self::next_datagram].
*/
pub struct Frame {
    buffer: Box<[u8; MAX_FRAME]>,
    /// end of the packed datagram region
    position: usize,
    /// number of datagrams packed
    count: usize,
    /// offset of the last datagram header, to mark it once a follower is packed
    last: usize,
    /// read position in the reply image
    consumed: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            buffer: Box::new([0; MAX_FRAME]),
            position: HEADER_SIZE,
            count: 0,
            last: 0,
            consumed: HEADER_SIZE,
        }
    }

    /// number of datagrams currently packed
    pub fn datagram_count(&self) -> usize {
        self.count
    }

    /// payload bytes available for one more datagram
    pub fn free_space(&self) -> usize {
        MAX_FRAME.saturating_sub(self.position + DATAGRAM_OVERHEAD)
    }

    /// true if a datagram with the given payload size cannot be appended
    pub fn full(&self, payload: usize) -> bool {
        self.count == MAX_DATAGRAMS || self.free_space() < payload
    }

    /// append one datagram, the payload bytes are sent as-is and overwritten by
    /// the slaves according to the command
    pub fn add_datagram(&mut self, index: u8, command: PduCommand, address: u32, payload: &[u8])
        -> EthercatResult<()>
    {
        if self.count == MAX_DATAGRAMS {
            return Err(EthercatError::Master("too many datagrams for one frame"));
        }
        if self.free_space() < payload.len() {
            return Err(EthercatError::Master("no space left in frame"));
        }
        if self.count != 0 {
            // the previous datagram must announce its follower: `multiple` is
            // the top bit of its length word
            self.buffer[self.last + 7] |= 0x80;
        }
        let header = DatagramHeader::new(
            command,
            index,
            address,
            u11::new(payload.len() as u16),
            false,
            false,
            0,
        );
        self.last = self.position;
        let used = {
            let mut cursor = Cursor::new(&mut self.buffer[self.position ..]);
            cursor.pack(&header)?;
            cursor.write(payload)?;
            // working counter, incremented by the slaves
            cursor.pack(&0u16)?;
            cursor.position()
        };
        self.position += used;
        self.count += 1;
        Ok(())
    }

    /// seal the frame header and expose the wire image
    pub fn finish(&mut self) -> EthercatResult<&[u8]> {
        let header = EthercatHeader::new(
            u11::new((self.position - HEADER_SIZE) as u16),
            EthercatType::Pdu,
        );
        header.pack(&mut self.buffer[.. HEADER_SIZE])?;
        Ok(&self.buffer[.. self.position])
    }

    /// whole buffer, to store a received image into
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// validate a reply image freshly stored in the buffer and rewind the
    /// datagram read position
    pub fn received(&mut self, length: usize) -> EthercatResult<()> {
        if length < HEADER_SIZE {
            return Err(EthercatError::Protocol("short read: no ethercat header"));
        }
        let header = EthercatHeader::unpack(self.buffer.as_slice())?;
        if header.ty() != EthercatType::Pdu {
            return Err(EthercatError::Protocol("reply frame is not a PDU frame"));
        }
        let content = usize::from(header.length().value());
        if HEADER_SIZE + content > length {
            return Err(EthercatError::Protocol("short read: frame truncated"));
        }
        self.position = HEADER_SIZE + content;
        self.consumed = HEADER_SIZE;
        Ok(())
    }

    /// pop the next reply datagram: its header, payload and working counter
    pub fn next_datagram(&mut self) -> EthercatResult<(DatagramHeader, &[u8], u16)> {
        if self.exhausted() {
            return Err(EthercatError::Master("every datagram in this frame was consumed"));
        }
        let header = DatagramHeader::unpack(&self.buffer[self.consumed ..])?;
        let length = usize::from(header.length().value());
        let start = self.consumed + DatagramHeader::PACKED_SIZE;
        if start + length + WKC_SIZE > self.position {
            return Err(EthercatError::Protocol("reply datagram truncated"));
        }
        let wkc = u16::unpack(&self.buffer[start + length ..])?;
        self.consumed = start + length + WKC_SIZE;
        Ok((header, &self.buffer[start .. start + length], wkc))
    }

    /// true once every reply datagram was popped
    pub fn exhausted(&self) -> bool {
        self.consumed >= self.position
    }

    /// reset for reuse
    pub fn clear(&mut self) {
        self.position = HEADER_SIZE;
        self.count = 0;
        self.last = 0;
        self.consumed = HEADER_SIZE;
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}
