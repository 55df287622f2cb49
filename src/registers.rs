//! structs and consts for the registers of a standard slave controller (ESC)
//! touched by the master. These should be used instead of any hardcoded
//! register address or magic value.

use crate::data::{bilge_pdudata, bilge_pdudata_wide, Field};
use bilge::prelude::*;


/// type of the slave controller, any safe register to probe the segment with
pub const esc_type: Field<u8> = Field::simple(0x0000);

/// slave addresses
/// ETG.1000.4 table 32
pub mod address {
    use super::*;

    /// station address, aka the fixed slave address, set by the master during bring-up
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// station address alias, loaded by the slave from its EEPROM
    pub const alias: Field<u16> = Field::simple(0x0012);
}

pub mod dl {
    use super::*;

    /// port control of the ESC data-link layer, zero restores automatic loop control
    pub const port: Field<u8> = Field::simple(0x0101);
}

/// registers of the application-layer (AL) state machine
pub mod al {
    use super::*;

    /// ETG.1000.6 table 9
    pub const control: Field<AlControl> = Field::simple(0x0120);
    /// ETG.1000.6 table 10
    pub const status: Field<AlStatus> = Field::simple(0x0130);
}

/**
    states of the application-layer state machine (ESM)

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlState {
    #[fallback]
    Invalid = 0x0,
    Init = 0x1,
    PreOperational = 0x2,
    Bootstrap = 0x3,
    SafeOperational = 0x4,
    Operational = 0x8,
}

/// AL state change request, written by the master
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct AlControl {
    /// requested state
    pub state: AlState,
    /// acknowledge the current error flag along with the request
    pub ack: bool,
    /// request the device identification instead of a state change
    pub id_request: bool,
    reserved: u10,
}
bilge_pdudata!(AlControl, u16);

/// AL state report, read by the master
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct AlStatus {
    /// state the slave is currently in
    pub state: AlState,
    /// the slave refused or failed a transition, details are in the AL status code
    pub error: bool,
    /// a device identification is loaded
    pub id_loaded: bool,
    reserved: u10,
}
bilge_pdudata!(AlStatus, u16);

/**
    mailbox protocols a slave implements, reported through its EEPROM

    ETG.1000.6 table 18
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct MailboxSupport {
    /// ADS over EtherCAT (routing and parallel services)
    pub aoe: bool,
    /// Ethernet over EtherCAT (tunnelling of data-link services)
    pub eoe: bool,
    /// CAN application protocol over EtherCAT (access to SDO)
    pub coe: bool,
    /// File access over EtherCAT
    pub foe: bool,
    /// Servo drive profile over EtherCAT
    pub soe: bool,
    /// Vendor specific protocol over EtherCAT
    pub voe: bool,
    reserved: u10,
}
bilge_pdudata!(MailboxSupport, u16);

impl MailboxSupport {
    /// true if the slave implements at least one mailbox protocol
    pub fn any(&self) -> bool {
        u16::from(*self) != 0
    }
}

impl Default for MailboxSupport {
    fn default() -> Self {
        Self::from(0)
    }
}

/// RX error counters, one pair per port, reset by writing any of them
/// ETG.1000.4 table 43
pub const ports_errors: Field<PortsErrorCount> = Field::simple(0x0300);

#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct PortsErrorCount {
    pub port: [PortErrorCount; 4],
}
bilge_pdudata!(PortsErrorCount, u64);

#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct PortErrorCount {
    /// frame errors, including RX errors within frame
    pub frame: u8,
    /// RX errors at the physical layer
    pub physical: u8,
}

/// fieldbus memory management units
pub mod fmmu {
    use super::*;

    /// the whole FMMU bank, 16 entries of 16 bytes, zeroed during bring-up
    /// ETG.1000.4 table 56
    pub const entries: Field<[u8; 256]> = Field::simple(0x0600);
}

/// sync manager channels mediating mailbox and process-data buffers
pub mod sync_manager {
    use super::*;

    pub const interface: SyncManager = SyncManager { address: 0x0800, num: 16 };
    /// the whole sync manager bank, zeroed during bring-up
    pub const entries: Field<[u8; 128]> = Field::simple(0x0800);
}

/// locator of the sync manager channel bank
/// ETG.1000.4 table 59
pub struct SyncManager {
    /// address of the first channel
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    /// configuration registers of one channel
    pub const fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        assert!(index < self.num, "index out of range");
        Field::simple((self.address + index as u16 * 0x8) as usize)
    }
    /// status byte alone of one channel
    pub const fn status(&self, index: u8) -> Field<SyncManagerStatus> {
        assert!(index < self.num, "index out of range");
        Field::simple((self.address + index as u16 * 0x8 + 0x5) as usize)
    }
}

/**
    one sync manager channel: a consistent area of the slave physical memory,
    exchanged either in handshake mode (mailbox) or buffered mode (process data)

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SyncManagerChannel {
    /// start address in the slave physical memory
    pub address: u16,
    /// byte length of the area
    pub length: u16,
    pub buffer_type: SyncBufferType,
    /// whether the area is read or written by the master
    pub direction: SyncBufferDirection,
    /// raise an ethercat event on master accesses
    pub ec_event: bool,
    /// raise a PDI interrupt on accesses from the other side
    pub dls_user_event: bool,
    /// monitor accesses to the area with the watchdog
    pub watchdog: bool,
    reserved: u1,
    /// the area (direction write) has been written by the master
    pub write_event: bool,
    /// the area (direction read) has been read by the master
    pub read_event: bool,
    reserved: u1,
    /// a complete mailbox message is waiting in the area
    pub mailbox_full: bool,
    /// buffer number or lock state in buffered mode
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,
    /// activate this channel
    pub enable: bool,
    /// repeat request, used to ask again for the last mailbox message
    pub repeat: bool,
    reserved: u4,
    /// invoke the DC 0 event on an ethercat write
    pub dc_event_bus: bool,
    /// invoke the DC 0 event on a local write
    pub dc_event_local: bool,
    /// disable PDI accesses to this channel
    pub disable_pdi: bool,
    /// repeat request acknowledge
    pub repeat_ack: bool,
    reserved: u6,
}
bilge_pdudata!(SyncManagerChannel, u64);

/// the status byte of a sync manager channel, polled alone when only the
/// mailbox state is of interest
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SyncManagerStatus {
    pub write_event: bool,
    pub read_event: bool,
    reserved: u1,
    /// a complete mailbox message is waiting in the area
    pub mailbox_full: bool,
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,
}
bilge_pdudata!(SyncManagerStatus, u8);

/// ETG.1000.4 table 58
#[bitsize(2)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncBufferType {
    Buffered = 0,
    #[fallback]
    Reserved = 1,
    Mailbox = 2,
}

/// ETG.1000.4 table 58
#[bitsize(2)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncBufferDirection {
    /// buffer is read by the master
    Read = 0,
    /// buffer is written by the master
    Write = 1,
    #[fallback]
    Reserved = 2,
}

/// registers reset during bring-up, the distributed clock is otherwise not
/// driven by this master
pub mod dc {
    use super::*;

    /// local copy of the system time
    /// ETG.1000.4 table 60
    pub const system_time: Field<u64> = Field::simple(0x0910);
    /// cyclic unit control: sync impulse generation
    pub const sync_activation: Field<u8> = Field::simple(0x0981);
    /// speed counter start, reset value 0x1000
    pub const speed_count_start: Field<u16> = Field::simple(0x0930);
    /// system time difference filter depth, reset value 0x0c00
    pub const time_filter: Field<u16> = Field::simple(0x0934);
}

/// slave information interface (SII), the gateway to the slave EEPROM
pub mod sii {
    use super::*;

    /// EEPROM access owner selection
    /// ETG.1000.4 table 48
    pub const access: Field<SiiAccess> = Field::simple(0x0500);
    /// control/status of the pending EEPROM operation
    /// ETG.1000.4 table 49
    pub const control: Field<SiiControl> = Field::simple(0x0502);
    /// control plus the word address of the operation, written in one go
    pub const control_address: Field<SiiControlAddress> = Field::simple(0x0502);
    /// word address alone
    pub const address: Field<u32> = Field::simple(0x0504);
    /// data read by the last EEPROM operation
    pub const data: Field<u32> = Field::simple(0x0508);
}

/// ETG.1000.4 table 48
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SiiAccess {
    pub owner: SiiOwner,
    pub lock: bool,
    reserved: u6,
    pub pdi: bool,
    reserved: u7,
}
bilge_pdudata!(SiiAccess, u16);

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiOwner {
    EthercatDL = 0,
    Pdi = 1,
}

/**
    register controlling the read/write operations of the SII

    ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SiiControl {
    /// true if the EEPROM is writable through the interface
    pub write_access: bool,
    reserved: u4,
    /// the DL-user emulates the EEPROM
    pub eeprom_emulation: bool,
    /// number of bytes fetched per read operation
    pub read_size: SiiTransaction,
    /// unit of the SII addresses
    pub address_unit: SiiUnit,
    /// read operation request (write) or read operation busy (read)
    pub read_operation: bool,
    /// write operation request (write) or write operation busy (read)
    pub write_operation: bool,
    /// reload operation request (write) or reload operation busy (read)
    pub reload_operation: bool,
    /// checksum error while reading at startup
    pub checksum_error: bool,
    /// error on reading device information
    pub device_info_error: bool,
    /// error on last command
    pub command_error: bool,
    /// error on last write operation
    pub write_error: bool,
    /// an operation is ongoing
    pub busy: bool,
}
bilge_pdudata!(SiiControl, u16);

impl Default for SiiControl {
    fn default() -> Self {
        Self::from(0)
    }
}

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiTransaction {
    Bytes4 = 0,
    Bytes8 = 1,
}

#[bitsize(1)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiiUnit {
    Byte = 0,
    Word = 1,
}

/// the EEPROM read request written to [sii::control_address]: a read operation
/// and the word to fetch
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SiiControlAddress {
    pub control: SiiControl,
    pub address: u32,
}
bilge_pdudata_wide!(SiiControlAddress, u48, u64, 6);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn al_control_image() {
        // request PRE-OP with error acknowledge: 0x12
        let control = AlControl::new(AlState::PreOperational, true, false);
        let mut image = [0; 2];
        control.pack(&mut image).unwrap();
        assert_eq!(image, [0x12, 0x00]);
    }

    #[test]
    fn al_status_error_flag() {
        let status = AlStatus::unpack(&[0x14, 0x00]).unwrap();
        assert_eq!(status.state(), AlState::SafeOperational);
        assert!(status.error());
    }

    #[test]
    fn sync_manager_mailbox_images() {
        // the mailbox channels must pack to the canonical control bytes:
        // 0x26 for the write (receive) mailbox, 0x22 for the read (send) one
        let mut receive = SyncManagerChannel::from(0);
        receive.set_address(0x1000);
        receive.set_length(0x80);
        receive.set_buffer_type(SyncBufferType::Mailbox);
        receive.set_direction(SyncBufferDirection::Write);
        receive.set_dls_user_event(true);
        receive.set_enable(true);
        let mut image = [0; 8];
        receive.pack(&mut image).unwrap();
        assert_eq!(image, [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00]);

        let mut send = receive;
        send.set_address(0x1400);
        send.set_direction(SyncBufferDirection::Read);
        send.pack(&mut image).unwrap();
        assert_eq!(image, [0x00, 0x14, 0x80, 0x00, 0x22, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn sii_busy_is_the_top_bit() {
        let control = SiiControl::unpack(&[0x00, 0x80]).unwrap();
        assert!(control.busy());
        let control = SiiControl::unpack(&[0x00, 0x00]).unwrap();
        assert!(!control.busy());
    }

    #[test]
    fn sii_read_request_image() {
        let mut control = SiiControl::default();
        control.set_read_operation(true);
        let request = SiiControlAddress::new(control, 0x12);
        let mut image = [0; 6];
        request.pack(&mut image).unwrap();
        // command 0x0100, address low 0x0012, address high 0
        assert_eq!(image, [0x00, 0x01, 0x12, 0x00, 0x00, 0x00]);
    }
}
