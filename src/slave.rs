//! data model of one device on the segment

use crate::mailbox::{Mailbox, MailboxConfig};
use crate::registers::MailboxSupport;

/**
    one slave of the segment

    Instances are created by the discovery stage of
    [Bus::init](crate::bus::Bus::init), filled from the slave EEPROM, and
    mutated only by the bus controller afterwards.
*/
#[derive(Default)]
pub struct Slave {
    /// station address assigned by the master
    pub address: u16,

    // identity, from the EEPROM
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,

    /// acyclic messaging channel used in every standard state
    pub mailbox: Mailbox,
    /// mailbox geometry advertised for the firmware-update bootstrap state
    pub mailbox_bootstrap: MailboxConfig,
    /// mailbox protocols the slave implements
    pub supported_mailbox: MailboxSupport,

    /// byte size of the EEPROM
    pub eeprom_size: u32,
    /// version of the EEPROM layout
    pub eeprom_version: u16,
}

impl Slave {
    pub fn new() -> Self {
        Self::default()
    }
}
