/*!
    per-slave acyclic messaging: outbound queue, session counters and dispatch
    of incoming mailbox messages to the transfers awaiting them

    A [Mailbox] owns the messages in flight for one slave. The bus controller
    moves the bytes (see [Bus::exchange_mailboxes](crate::bus::Bus)); the
    mailbox decides which message goes out next and which in-flight transfer
    claims each reply.
*/

use crate::can::{CanService, CoeHeader, Emergency, EmergencyMessage, SdoMessage};
use crate::data::{bilge_pdudata, bilge_pdudata_wide, PduData};
use crate::error::{EthercatError, EthercatResult};
use bilge::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};


/// emergencies retained per slave, the oldest are dropped beyond this
const MAX_EMERGENCIES: usize = 32;

/// geometry and last observed availability of a slave mailbox
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxConfig {
    /// receive (master to slave) window in the slave physical memory
    pub recv_offset: u16,
    pub recv_size: u16,
    /// send (slave to master) window in the slave physical memory
    pub send_offset: u16,
    pub send_size: u16,
    /// a message is waiting in the send window
    pub read_available: bool,
    /// the receive window can take a new message
    pub write_available: bool,
}

/// outcome of handing a received mailbox message to an in-flight transfer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessingResult {
    /// the message is not related to this transfer
    Noop,
    /// the transfer needs another round-trip, its next message is ready
    Continue,
    /// the transfer is complete
    Finalize,
    /// the transfer is complete but stays installed for further replies
    FinalizeAndKeep,
}

/// state of an acyclic transfer, polled by the caller through its handle
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageStatus {
    /// the transfer is not finished yet
    Running,
    /// the transfer completed
    Success,
    /// the reply did not carry the expected CoE service
    WrongService,
    /// the reply carried a CoE service this master does not implement
    UnknownService,
    /// the server sent more bytes than the caller buffer can hold
    BufferTooSmall,
    /// a segment came with an unexpected toggle bit
    BadToggle,
    /// the server aborted the SDO transfer with this code
    Abort(u32),
}

/// an acyclic transfer owned by a mailbox while in flight
pub enum Message {
    Sdo(SdoMessage),
    Emergency(EmergencyMessage),
}

impl Message {
    pub fn status(&self) -> MessageStatus {
        match self {
            Self::Sdo(message) => message.status(),
            Self::Emergency(message) => message.status(),
        }
    }
    /// bytes to place in the slave receive window
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Sdo(message) => message.data(),
            Self::Emergency(_) => &[],
        }
    }
    pub(crate) fn set_counter(&mut self, counter: u8) {
        if let Self::Sdo(message) = self {
            message.set_counter(counter);
        }
    }
    pub(crate) fn process(&mut self, raw: &[u8]) -> ProcessingResult {
        match self {
            Self::Sdo(message) => message.process(raw),
            Self::Emergency(message) => message.process(raw),
        }
    }
}

/// shared handle on a message: the caller polls it while the mailbox moves it
/// between its queues
pub type MessageHandle = Arc<Mutex<Message>>;

/**
    acyclic channel state of one slave
*/
pub struct Mailbox {
    pub config: MailboxConfig,
    /// session handle of the last sent message, wire values cycle in 1 ..= 7
    counter: u8,
    /// messages waiting for the next write slot
    to_send: VecDeque<MessageHandle>,
    /// messages transmitted and awaiting their reply
    to_process: Vec<MessageHandle>,
    /// emergencies captured out of band
    pub emergencies: VecDeque<Emergency>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            config: MailboxConfig::default(),
            counter: 0,
            to_send: VecDeque::new(),
            to_process: Vec::new(),
            emergencies: VecDeque::new(),
        }
    }

    /// messages waiting to be transmitted
    pub fn queued(&self) -> usize {
        self.to_send.len()
    }
    /// messages transmitted and awaiting a reply
    pub fn pending(&self) -> usize {
        self.to_process.len()
    }

    /// enqueue a message for transmission and share its handle with the caller
    pub fn push(&mut self, message: Message) -> MessageHandle {
        let handle = Arc::new(Mutex::new(message));
        self.to_send.push_back(handle.clone());
        handle
    }

    /// enqueue an SDO upload: the value of the dictionary entry will land in a
    /// buffer of `capacity` bytes
    pub fn sdo_upload(&mut self, index: u16, subindex: u8, complete: bool, capacity: usize) -> MessageHandle {
        self.push(Message::Sdo(SdoMessage::upload(self.config.recv_size, index, subindex, complete, capacity)))
    }

    /// enqueue an SDO download of the given bytes
    pub fn sdo_download(&mut self, index: u16, subindex: u8, complete: bool, data: &[u8]) -> MessageHandle {
        self.push(Message::Sdo(SdoMessage::download(self.config.recv_size, index, subindex, complete, data)))
    }

    /// install the emergency watcher: it claims every emergency reply, feeds
    /// [Self::emergencies] and never completes
    pub fn install_emergency(&mut self) -> MessageHandle {
        let handle = Arc::new(Mutex::new(Message::Emergency(EmergencyMessage::new())));
        self.to_process.push(handle.clone());
        handle
    }

    /**
        pop the next message to transmit, if the slave advertised room for it

        The message is stamped with a fresh session counter and moved to the
        in-flight set; the caller is in charge of putting its bytes on the wire.
    */
    pub fn send(&mut self) -> Option<MessageHandle> {
        if !self.config.write_available {
            return None;
        }
        let handle = self.to_send.pop_front()?;
        let counter = self.next_counter();
        match handle.lock() {
            Ok(mut message) => message.set_counter(counter),
            Err(_) => log::error!("mailbox message handle poisoned, sending it unstamped"),
        }
        self.config.write_available = false;
        self.to_process.push(handle.clone());
        Some(handle)
    }

    /// put back a message whose transmission did not reach the slave
    pub fn requeue(&mut self, handle: &MessageHandle) {
        self.to_process.retain(|message| !Arc::ptr_eq(message, handle));
        self.to_send.push_front(handle.clone());
        self.config.write_available = true;
    }

    /**
        dispatch a message read from the slave send window

        Each in-flight transfer is offered the bytes in insertion order until
        one claims them. An unclaimed emergency is captured anyway; any other
        unclaimed message is reported and dropped.
    */
    pub fn receive(&mut self, raw: &[u8]) -> EthercatResult<(), MailboxError> {
        let header = MailboxHeader::unpack(raw)?;
        let content = raw.get(MailboxHeader::PACKED_SIZE .. MailboxHeader::PACKED_SIZE + usize::from(header.length()))
            .ok_or(EthercatError::Protocol("mailbox message truncated"))?;

        if header.ty() == MailboxType::Exception {
            let error = MailboxErrorFrame::unpack(content)?;
            return Err(EthercatError::Slave(error.detail()));
        }

        let mut claimed = None;
        for (position, handle) in self.to_process.iter().enumerate() {
            let Ok(mut message) = handle.lock() else { continue };
            match message.process(raw) {
                ProcessingResult::Noop => continue,
                result => {
                    claimed = Some((position, result));
                    break;
                }
            }
        }
        match claimed {
            Some((position, ProcessingResult::Finalize)) => {
                self.to_process.remove(position);
                Ok(())
            }
            Some((position, ProcessingResult::FinalizeAndKeep)) => {
                // the watcher stashed the decoded emergency, collect it
                let handle = self.to_process[position].clone();
                if let Ok(mut message) = handle.lock() {
                    if let Message::Emergency(watcher) = &mut *message {
                        if let Some(emergency) = watcher.take() {
                            self.push_emergency(emergency);
                        }
                    }
                }
                Ok(())
            }
            Some((position, ProcessingResult::Continue)) => {
                let handle = self.to_process.remove(position);
                self.to_send.push_back(handle);
                Ok(())
            }
            Some((_, ProcessingResult::Noop)) | None => {
                if header.ty() == MailboxType::Can
                    && CoeHeader::unpack(content).is_ok_and(|coe| coe.service() == CanService::Emergency)
                {
                    if let Some(emergency) = Emergency::from_payload(&content[CoeHeader::PACKED_SIZE ..]) {
                        self.push_emergency(emergency);
                        return Ok(());
                    }
                }
                Err(EthercatError::Protocol("unclaimed mailbox message"))
            }
        }
    }

    fn push_emergency(&mut self, emergency: Emergency) {
        if self.emergencies.len() == MAX_EMERGENCIES {
            self.emergencies.pop_front();
        }
        self.emergencies.push_back(emergency);
    }

    /// next session handle: 0 is reserved, wire values cycle in 1 ..= 7
    fn next_counter(&mut self) -> u8 {
        self.counter = self.counter % 7 + 1;
        self.counter
    }
}

/// header starting every mailbox message
/// ETG.1000.4 table 29
#[bitsize(48)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// byte length of the service data following this header
    pub length: u16,
    /// station address of the source (master as client) or of the destination
    /// (slave as client)
    pub address: u16,
    /// reserved for future use
    pub channel: u6,
    /// 0 is the lowest priority, 3 the highest
    pub priority: u2,
    pub ty: MailboxType,
    /// session handle, 0 reserved, rolls from 7 to 1
    pub count: u3,
    reserved: u1,
}
bilge_pdudata_wide!(MailboxHeader, u48, u64, 6);

/// type of mailbox service
/// ETG.1000.4 table 29
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    Specific = 0xf,
}

/// content of a mailbox message of type [MailboxType::Exception]
/// ETG.1000.4 table 30
#[bitsize(32)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct MailboxErrorFrame {
    ty: u16,
    detail: MailboxError,
}
bilge_pdudata!(MailboxErrorFrame, u32);

/// error reported by a slave mailbox
/// ETG.1000.4 table 30
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_mailbox() -> Mailbox {
        let mut mailbox = Mailbox::new();
        mailbox.config.recv_size = 128;
        mailbox.config.send_size = 128;
        mailbox.config.write_available = true;
        mailbox
    }

    #[test]
    fn counters_cycle_skipping_zero() {
        let mut mailbox = Mailbox::new();
        let run: Vec<_> = (0 .. 16).map(|_| mailbox.next_counter()).collect();
        assert!(run.iter().all(|counter| (1 ..= 7).contains(counter)));
        assert_eq!(&run[.. 8], &[1, 2, 3, 4, 5, 6, 7, 1]);
    }

    #[test]
    fn send_is_gated_by_the_write_slot() {
        let mut mailbox = armed_mailbox();
        assert!(mailbox.send().is_none());

        mailbox.sdo_upload(0x1018, 1, false, 4);
        let sent = mailbox.send().expect("a message and a slot are available");
        assert_eq!(mailbox.pending(), 1);
        assert_eq!(mailbox.queued(), 0);
        // the stamped counter is on the wire image
        let message = sent.lock().unwrap();
        let header = MailboxHeader::unpack(message.data()).unwrap();
        assert_eq!(header.count().value(), 1);
        drop(message);

        // the slot is taken until the next status poll
        mailbox.sdo_upload(0x1018, 2, false, 4);
        assert!(mailbox.send().is_none());
    }

    #[test]
    fn header_image() {
        let header = MailboxHeader::new(10, 0, u6::new(0), u2::new(0), MailboxType::Can, u3::new(5));
        let mut image = [0; 6];
        header.pack(&mut image).unwrap();
        assert_eq!(image, [0x0a, 0x00, 0x00, 0x00, 0x00, 0x53]);
    }

    #[test]
    fn unclaimed_messages_are_reported() {
        let mut mailbox = armed_mailbox();
        // a CoE SDO response nobody waits for
        let raw = [
            0x0a, 0x00, 0x00, 0x00, 0x00, 0x33,
            0x00, 0x30,
            0x43, 0x18, 0x10, 0x01, 0xaa, 0xbb, 0xcc, 0xdd,
        ];
        assert!(matches!(
            mailbox.receive(&raw),
            Err(EthercatError::Protocol("unclaimed mailbox message")),
        ));
    }

    #[test]
    fn exception_frames_surface_the_slave_error() {
        let mut mailbox = armed_mailbox();
        // type Exception, detail UnsupportedProtocol
        let raw = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x02, 0x00,
        ];
        assert!(matches!(
            mailbox.receive(&raw),
            Err(EthercatError::Slave(MailboxError::UnsupportedProtocol)),
        ));
    }

    #[test]
    fn stray_emergencies_are_captured_without_a_watcher() {
        let mut mailbox = armed_mailbox();
        let raw = [
            0x0a, 0x00, 0x00, 0x00, 0x00, 0x03,
            0x00, 0x10,
            0x00, 0x10, 0x04, 1, 2, 3, 4, 5,
        ];
        mailbox.receive(&raw).unwrap();
        assert_eq!(mailbox.emergencies.len(), 1);
        assert_eq!(mailbox.emergencies[0].error_code, 0x1000);
    }
}
