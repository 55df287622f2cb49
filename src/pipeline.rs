/*!
    aggregation of datagrams into a pool of preallocated frames

    Datagrams appended between two [Pipeline::process_frames] calls form one
    batch. The batch is flushed frame by frame through the [Link], then replies
    are handed back strictly in the order the datagrams were appended, across
    frame boundaries. This positional correspondence is what every register walk
    of the bus relies on, so any change here must preserve it.
*/

use crate::data::PduData;
use crate::error::{EthercatError, EthercatResult};
use crate::frame::{DatagramHeader, Frame, PduCommand, MAX_DATAGRAMS};
use crate::link::Link;
use crate::socket::EthercatSocket;


pub struct Pipeline<S: EthercatSocket> {
    link: Link<S>,
    frames: Vec<Frame>,
    /// frame currently being filled
    current: usize,
    /// frame currently being consumed
    reading: usize,
    /// correlator stamped in the next datagram
    index: u8,
    /// true when the frames hold reply images
    delivered: bool,
}

impl<S: EthercatSocket> Pipeline<S> {
    pub fn new(link: Link<S>) -> Self {
        Self {
            link,
            frames: vec![Frame::new()],
            current: 0,
            reading: 0,
            index: 0,
            delivered: false,
        }
    }

    /// number of frames needed to carry the given number of datagrams
    pub fn frames_for(datagrams: usize) -> usize {
        (datagrams + MAX_DATAGRAMS - 1) / MAX_DATAGRAMS
    }

    /// grow the frame pool so `count` frames are available without allocation
    /// in later batches
    pub fn reserve(&mut self, count: usize) {
        while self.frames.len() < count {
            self.frames.push(Frame::new());
        }
    }

    /// append a datagram to the current batch, spilling into the next
    /// preallocated frame when the current one is full
    pub fn add_datagram(&mut self, command: PduCommand, address: u32, payload: &[u8])
        -> EthercatResult<()>
    {
        if self.delivered {
            // a new batch begins over the delivered one
            self.discard();
        }
        if self.frames[self.current].full(payload.len()) {
            if self.current + 1 == self.frames.len() {
                return Err(EthercatError::Master("frame pool exhausted"));
            }
            self.current += 1;
        }
        let index = self.index;
        self.index = self.index.wrapping_add(1);
        self.frames[self.current].add_datagram(index, command, address, payload)
    }

    /// flush the batch: exchange every non-empty frame through the link, in
    /// order, one frame on the wire at a time
    ///
    /// A transport failure aborts and discards the whole batch.
    pub async fn process_frames(&mut self) -> EthercatResult<()> {
        if self.delivered {
            // nothing was appended since the last flush
            return Ok(());
        }
        for position in 0 .. self.frames.len() {
            if self.frames[position].datagram_count() == 0 {
                break;
            }
            if let Err(error) = self.link.exchange(&mut self.frames[position]).await {
                self.discard();
                return Err(error);
            }
        }
        self.current = 0;
        self.reading = 0;
        self.delivered = true;
        Ok(())
    }

    /// drop any pending datagram or unconsumed reply and start a fresh batch
    pub fn discard(&mut self) {
        for frame in &mut self.frames {
            frame.clear();
        }
        self.current = 0;
        self.reading = 0;
        self.delivered = false;
    }

    /// pop the next reply datagram with its payload decoded as `T`
    ///
    /// The payload size must match the packed size of `T` exactly.
    pub fn next_datagram<T: PduData>(&mut self) -> EthercatResult<(DatagramHeader, T, u16)> {
        let (header, payload, wkc) = self.next_datagram_raw()?;
        if payload.len() != T::PACKED_SIZE {
            return Err(EthercatError::Protocol("reply datagram size does not match the expected type"));
        }
        let value = T::unpack(payload)?;
        Ok((header, value, wkc))
    }

    /// pop the next reply datagram of the batch, in the exact order datagrams
    /// were appended
    pub fn next_datagram_raw(&mut self) -> EthercatResult<(DatagramHeader, &[u8], u16)> {
        if !self.delivered {
            return Err(EthercatError::Master("no reply to consume, process the frames first"));
        }
        while self.reading < self.frames.len() && self.frames[self.reading].exhausted() {
            self.reading += 1;
        }
        if self.reading == self.frames.len() {
            return Err(EthercatError::Master("every reply of this batch was consumed"));
        }
        self.frames[self.reading].next_datagram()
    }
}
