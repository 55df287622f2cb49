/*!
    implementation of CoE (CANopen over EtherCAT) transfers

    These work exactly as on a CAN bus, except every frame is encapsulated in a
    mailbox message. The two message kinds of this module plug into a
    [Mailbox](crate::mailbox::Mailbox): [SdoMessage] runs one SDO upload or
    download to completion, [EmergencyMessage] watches for emergency frames.
*/

use crate::data::{bilge_pdudata, PduData};
use crate::mailbox::{MailboxHeader, MailboxType, MessageStatus, ProcessingResult};
use bilge::prelude::*;


const MAILBOX_HEADER: usize = MailboxHeader::PACKED_SIZE;
const COE_HEADER: usize = CoeHeader::PACKED_SIZE;
const SDO_HEADER: usize = SdoHeader::PACKED_SIZE;
const SEGMENT_HEADER: usize = SdoSegmentHeader::PACKED_SIZE;

/// biggest value fitting the expedited form
const EXPEDITED_MAX: usize = 4;
/// segments keep the 7 data bytes of the CAN layout as a minimum, shorter ones
/// are padded and carry the padding count in their size field
const SEGMENT_MIN_DATA: usize = 7;

/// abort command specifier, identical in both directions
const ABORT: u8 = 4;

/// client to server command specifiers (ETG.1000.6 5.6.2)
mod ccs {
    pub const DOWNLOAD_SEGMENT: u8 = 0;
    pub const DOWNLOAD: u8 = 1;
    pub const UPLOAD: u8 = 2;
    pub const UPLOAD_SEGMENT: u8 = 3;
}

/// server to client command specifiers (ETG.1000.6 5.6.2)
mod scs {
    pub const UPLOAD_SEGMENT: u8 = 0;
    pub const DOWNLOAD_SEGMENT: u8 = 1;
    pub const UPLOAD: u8 = 2;
    pub const DOWNLOAD: u8 = 3;
}

/// header starting the CoE content of a mailbox message
/// ETG.1000.6 5.6.1
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// PDO number, unused for SDO services
    pub number: u9,
    reserved: u3,
    pub service: CanService,
}
bilge_pdudata!(CoeHeader, u16);

/// type of CoE service
///
/// transmitting and receiving is from the point of view of the slave
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanService {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}

/// header of SDO initiate and abort frames
/// ETG.1000.6 5.6.2
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoHeader {
    /// true if the `size` field is meaningful
    pub sized: bool,
    /// true for an expedited transfer, the value then rides in the frame bytes
    /// normally carrying the complete size
    pub expedited: bool,
    /// number of unused bytes in an expedited value
    pub size: u2,
    /// true if a complete SDO is accessed instead of one subindex
    pub complete: bool,
    /// command specifier, see [ccs] and [scs]
    pub command: u3,
    /// SDO index
    pub index: u16,
    /// SDO subindex; for complete access, 0 or 1 to include or exclude
    /// subindex 0 from the transfer
    pub sub: u8,
}
bilge_pdudata!(SdoHeader, u32);

/// header of SDO segment frames
/// ETG.1000.6 5.6.2
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoSegmentHeader {
    /// true on the last segment of the transfer
    pub last: bool,
    /// number of padding bytes in the segment data
    pub size: u3,
    /// alternates on every segment, starting at 0
    pub toggle: bool,
    /// command specifier, see [ccs] and [scs]
    pub command: u3,
}
bilge_pdudata!(SdoSegmentHeader, u8);

/// direction of an SDO transfer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdoDirection {
    /// read a dictionary entry from the slave
    Upload,
    /// write a dictionary entry to the slave
    Download,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SdoStage {
    /// the initiate request is out
    Initiate,
    /// a segment request is out
    Segment,
}

/// append a packed value to a message under construction
fn extend<T: PduData>(data: &mut Vec<u8>, value: &T) {
    let start = data.len();
    data.resize(start + T::PACKED_SIZE, 0);
    // the window is exactly the packed size, this cannot fail
    let _ = value.pack(&mut data[start ..]);
}

/**
    one SDO upload or download, driven to completion through a mailbox

    The server chooses between the expedited, normal and segmented forms on
    upload; on download the form follows from the value size against the
    mailbox capacity. The caller tolerates all three.
*/
pub struct SdoMessage {
    /// next outbound mailbox message
    data: Vec<u8>,
    status: MessageStatus,
    stage: SdoStage,
    request: SdoDirection,
    index: u16,
    sub: u8,
    complete: bool,
    /// session counter stamped on the last transmission
    counter: u8,
    /// caller buffer: upload destination or download source
    client: Vec<u8>,
    /// bytes moved between the client buffer and the wire so far
    transferred: usize,
    /// total byte size of the transfer, announced by the server on upload
    total: usize,
    /// expected toggle bit of the next segment
    toggle: bool,
    /// byte capacity of one mailbox message on this slave
    mailbox_size: usize,
}

impl SdoMessage {
    pub fn new(mailbox_size: u16, index: u16, subindex: u8, complete: bool,
               direction: SdoDirection, client: Vec<u8>) -> Self
    {
        let total = match direction {
            SdoDirection::Upload => 0,
            SdoDirection::Download => client.len(),
        };
        let mut new = Self {
            data: Vec::new(),
            status: MessageStatus::Running,
            stage: SdoStage::Initiate,
            request: direction,
            index,
            sub: subindex,
            complete,
            counter: 0,
            client,
            transferred: 0,
            total,
            toggle: false,
            mailbox_size: usize::from(mailbox_size),
        };
        match direction {
            SdoDirection::Upload => new.emit_upload_request(),
            SdoDirection::Download => new.emit_download_request(),
        }
        new
    }

    /// build an upload of at most `capacity` bytes
    pub fn upload(mailbox_size: u16, index: u16, subindex: u8, complete: bool, capacity: usize) -> Self {
        Self::new(mailbox_size, index, subindex, complete, SdoDirection::Upload, vec![0; capacity])
    }

    /// build a download of the given bytes
    pub fn download(mailbox_size: u16, index: u16, subindex: u8, complete: bool, data: &[u8]) -> Self {
        Self::new(mailbox_size, index, subindex, complete, SdoDirection::Download, data.to_vec())
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// number of bytes actually transferred once the status is
    /// [MessageStatus::Success]
    pub fn data_size(&self) -> usize {
        self.transferred
    }

    /// content received by an upload
    pub fn received(&self) -> &[u8] {
        &self.client[.. self.transferred]
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn set_counter(&mut self, counter: u8) {
        self.counter = counter;
        if let Ok(mut header) = MailboxHeader::unpack(&self.data) {
            header.set_count(u3::new(counter & 0x7));
            let _ = header.pack(&mut self.data);
        }
    }

    /// mailbox and CoE headers starting every outbound message
    fn start(&mut self, length: u16) {
        self.data.clear();
        extend(&mut self.data, &MailboxHeader::new(
            length, 0, u6::new(0), u2::new(0), MailboxType::Can, u3::new(self.counter & 0x7)));
        extend(&mut self.data, &CoeHeader::new(u9::new(0), CanService::SdoRequest));
    }

    fn emit_upload_request(&mut self) {
        let length = (COE_HEADER + SDO_HEADER + EXPEDITED_MAX) as u16;
        self.start(length);
        extend(&mut self.data, &SdoHeader::new(
            false, false, u2::new(0), self.complete, u3::new(ccs::UPLOAD), self.index, self.sub));
        self.data.resize(MAILBOX_HEADER + usize::from(length), 0);
    }

    fn emit_upload_segment_request(&mut self) {
        let length = (COE_HEADER + SEGMENT_HEADER + SEGMENT_MIN_DATA) as u16;
        self.start(length);
        extend(&mut self.data, &SdoSegmentHeader::new(
            false, u3::new(0), self.toggle, u3::new(ccs::UPLOAD_SEGMENT)));
        self.data.resize(MAILBOX_HEADER + usize::from(length), 0);
    }

    fn emit_download_request(&mut self) {
        if self.total <= EXPEDITED_MAX {
            let length = (COE_HEADER + SDO_HEADER + EXPEDITED_MAX) as u16;
            self.start(length);
            extend(&mut self.data, &SdoHeader::new(
                true, true, u2::new((EXPEDITED_MAX - self.total) as u8), self.complete,
                u3::new(ccs::DOWNLOAD), self.index, self.sub));
            let value = self.data.len();
            self.data.resize(value + EXPEDITED_MAX, 0);
            self.data[value ..][.. self.total].copy_from_slice(&self.client);
            self.transferred = self.total;
        } else {
            let chunk = self.total.min(self.request_capacity());
            let length = (COE_HEADER + SDO_HEADER + EXPEDITED_MAX + chunk) as u16;
            self.start(length);
            extend(&mut self.data, &SdoHeader::new(
                true, false, u2::new(0), self.complete,
                u3::new(ccs::DOWNLOAD), self.index, self.sub));
            extend(&mut self.data, &(self.total as u32));
            self.data.extend_from_slice(&self.client[.. chunk]);
            self.transferred = chunk;
        }
    }

    fn emit_download_segment(&mut self) {
        let remaining = self.total - self.transferred;
        let chunk = remaining.min(self.segment_capacity());
        let padding = SEGMENT_MIN_DATA.saturating_sub(chunk);
        let length = (COE_HEADER + SEGMENT_HEADER + chunk + padding) as u16;
        self.start(length);
        extend(&mut self.data, &SdoSegmentHeader::new(
            chunk == remaining, u3::new(padding as u8), self.toggle,
            u3::new(ccs::DOWNLOAD_SEGMENT)));
        self.data.extend_from_slice(&self.client[self.transferred ..][.. chunk]);
        let end = self.data.len();
        self.data.resize(end + padding, 0);
        self.transferred += chunk;
    }

    /// bytes of value fitting a download initiate request
    fn request_capacity(&self) -> usize {
        self.mailbox_size.saturating_sub(MAILBOX_HEADER + COE_HEADER + SDO_HEADER + EXPEDITED_MAX)
    }

    /// bytes of value fitting one segment
    fn segment_capacity(&self) -> usize {
        self.mailbox_size.saturating_sub(MAILBOX_HEADER + COE_HEADER + SEGMENT_HEADER)
    }

    pub(crate) fn process(&mut self, raw: &[u8]) -> ProcessingResult {
        let Ok(header) = MailboxHeader::unpack(raw) else { return ProcessingResult::Noop };
        if header.ty() != MailboxType::Can {
            return ProcessingResult::Noop;
        }
        if header.count().value() != self.counter {
            return ProcessingResult::Noop;
        }
        let Some(content) = raw.get(MAILBOX_HEADER .. MAILBOX_HEADER + usize::from(header.length())) else {
            return ProcessingResult::Noop;
        };
        let Ok(coe) = CoeHeader::unpack(content) else {
            // the reply is ours but its service is not one this master knows
            self.status = MessageStatus::UnknownService;
            return ProcessingResult::Finalize;
        };
        let payload = &content[COE_HEADER ..];
        match coe.service() {
            CanService::SdoResponse => (),
            // an abort rides the request service whichever side emits it
            CanService::SdoRequest => return self.process_abort(payload),
            CanService::Emergency => return ProcessingResult::Noop,
            _ => {
                self.status = MessageStatus::WrongService;
                return ProcessingResult::Finalize;
            }
        }
        // some servers answer aborts under the response service
        if payload.first().is_some_and(|&first| first >> 5 == ABORT) {
            return self.process_abort(payload);
        }
        match (self.stage, self.request) {
            (SdoStage::Initiate, SdoDirection::Upload) => self.process_upload(payload),
            (SdoStage::Initiate, SdoDirection::Download) => self.process_download(payload),
            (SdoStage::Segment, SdoDirection::Upload) => self.process_upload_segment(payload),
            (SdoStage::Segment, SdoDirection::Download) => self.process_download_segment(payload),
        }
    }

    fn process_abort(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(sdo) = SdoHeader::unpack(payload) else { return ProcessingResult::Noop };
        if sdo.command().value() != ABORT {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if sdo.index() != self.index || sdo.sub() != self.sub {
            return ProcessingResult::Noop;
        }
        let code = u32::unpack(&payload[SDO_HEADER ..]).unwrap_or(0);
        self.status = MessageStatus::Abort(code);
        ProcessingResult::Finalize
    }

    fn process_upload(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(sdo) = SdoHeader::unpack(payload) else { return ProcessingResult::Noop };
        if sdo.index() != self.index || sdo.sub() != self.sub {
            return ProcessingResult::Noop;
        }
        if sdo.command().value() != scs::UPLOAD {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        let payload = &payload[SDO_HEADER ..];
        if sdo.expedited() {
            let size = match sdo.sized() {
                true => EXPEDITED_MAX - usize::from(sdo.size().value()),
                false => EXPEDITED_MAX,
            };
            if payload.len() < size {
                return ProcessingResult::Noop;
            }
            if size > self.client.len() {
                self.status = MessageStatus::BufferTooSmall;
                return ProcessingResult::Finalize;
            }
            self.client[.. size].copy_from_slice(&payload[.. size]);
            self.transferred = size;
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        // normal transfer: the complete size, then the first bytes
        let Ok(total) = u32::unpack(payload) else { return ProcessingResult::Noop };
        let total = total as usize;
        if total > self.client.len() {
            self.status = MessageStatus::BufferTooSmall;
            return ProcessingResult::Finalize;
        }
        let chunk = &payload[EXPEDITED_MAX ..];
        let chunk = &chunk[.. chunk.len().min(total)];
        self.client[.. chunk.len()].copy_from_slice(chunk);
        self.transferred = chunk.len();
        self.total = total;
        if self.transferred >= self.total {
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        self.stage = SdoStage::Segment;
        self.toggle = false;
        self.emit_upload_segment_request();
        ProcessingResult::Continue
    }

    fn process_upload_segment(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(segment) = SdoSegmentHeader::unpack(payload) else { return ProcessingResult::Noop };
        if segment.command().value() != scs::UPLOAD_SEGMENT {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if segment.toggle() != self.toggle {
            self.status = MessageStatus::BadToggle;
            return ProcessingResult::Finalize;
        }
        let data = &payload[SEGMENT_HEADER ..];
        let chunk = data.len().saturating_sub(usize::from(segment.size().value()));
        if self.transferred + chunk > self.client.len() {
            self.status = MessageStatus::BufferTooSmall;
            return ProcessingResult::Finalize;
        }
        self.client[self.transferred ..][.. chunk].copy_from_slice(&data[.. chunk]);
        self.transferred += chunk;
        self.toggle = !self.toggle;
        if segment.last() {
            self.status = MessageStatus::Success;
            ProcessingResult::Finalize
        } else {
            self.emit_upload_segment_request();
            ProcessingResult::Continue
        }
    }

    fn process_download(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(sdo) = SdoHeader::unpack(payload) else { return ProcessingResult::Noop };
        if sdo.index() != self.index || sdo.sub() != self.sub {
            return ProcessingResult::Noop;
        }
        if sdo.command().value() != scs::DOWNLOAD {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if self.transferred >= self.total {
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        self.stage = SdoStage::Segment;
        self.toggle = false;
        self.emit_download_segment();
        ProcessingResult::Continue
    }

    fn process_download_segment(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(segment) = SdoSegmentHeader::unpack(payload) else { return ProcessingResult::Noop };
        if segment.command().value() != scs::DOWNLOAD_SEGMENT {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if segment.toggle() != self.toggle {
            self.status = MessageStatus::BadToggle;
            return ProcessingResult::Finalize;
        }
        self.toggle = !self.toggle;
        if self.transferred >= self.total {
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        self.emit_download_segment();
        ProcessingResult::Continue
    }
}

/// CoE emergency payload
/// ETG.1000.6 5.6.4
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Emergency {
    pub error_code: u16,
    pub error_register: u8,
    /// manufacturer specific diagnostic bytes
    pub data: [u8; 5],
}

impl Emergency {
    /// byte size of the payload on the wire
    pub const PACKED_SIZE: usize = 8;

    pub(crate) fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::PACKED_SIZE {
            return None;
        }
        let mut data = [0; 5];
        data.copy_from_slice(&payload[3 .. 8]);
        Some(Self {
            error_code: u16::from_le_bytes([payload[0], payload[1]]),
            error_register: payload[2],
            data,
        })
    }
}

/**
    latent message claiming every CoE emergency reply of its mailbox

    Once installed it never completes: every capture is handed to the mailbox
    emergency buffer and the watcher stays armed.
*/
pub struct EmergencyMessage {
    pending: Option<Emergency>,
}

impl Default for EmergencyMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyMessage {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn status(&self) -> MessageStatus {
        MessageStatus::Running
    }

    /// hand over the last captured emergency
    pub(crate) fn take(&mut self) -> Option<Emergency> {
        self.pending.take()
    }

    pub(crate) fn process(&mut self, raw: &[u8]) -> ProcessingResult {
        let Ok(header) = MailboxHeader::unpack(raw) else { return ProcessingResult::Noop };
        if header.ty() != MailboxType::Can {
            return ProcessingResult::Noop;
        }
        let Some(content) = raw.get(MAILBOX_HEADER .. MAILBOX_HEADER + usize::from(header.length())) else {
            return ProcessingResult::Noop;
        };
        let Ok(coe) = CoeHeader::unpack(content) else { return ProcessingResult::Noop };
        if coe.service() != CanService::Emergency {
            return ProcessingResult::Noop;
        }
        let Some(emergency) = Emergency::from_payload(&content[COE_HEADER ..]) else {
            return ProcessingResult::Noop;
        };
        self.pending = Some(emergency);
        ProcessingResult::FinalizeAndKeep
    }
}
