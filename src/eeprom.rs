/*!
    word addresses in the slave EEPROM (SII) consulted during bring-up, and the
    decoding rules of their content

    The EEPROM is addressed in 16-bit words; every read through the SII data
    register yields two consecutive words at once.

    ETG.1000.6 table 16
*/

/// standard identity of the product the slave is
pub mod device {
    /// unique id of the vendor (normalized by the ETG)
    pub const vendor: u16 = 0x0008;
    /// unique id of the product (normalized by the vendor)
    pub const product: u16 = 0x000a;
    /// unique id of the product revision (normalized by the vendor)
    pub const revision: u16 = 0x000c;
    /// unique serial number of the product (normalized by the vendor)
    pub const serial_number: u16 = 0x000e;
}

/// recommended mailbox configurations
pub mod mailbox {
    /// mailbox windows to use during the firmware-update bootstrap state
    pub mod bootstrap {
        /// {offset, size} of the receive (master to slave) window
        pub const recv: u16 = 0x0014;
        /// {offset, size} of the send (slave to master) window
        pub const send: u16 = 0x0016;
    }
    /// mailbox windows to use in every other state
    pub mod standard {
        /// {offset, size} of the receive (master to slave) window
        pub const recv: u16 = 0x0018;
        /// {offset, size} of the send (slave to master) window
        pub const send: u16 = 0x001a;
    }
    /// mailbox protocols implemented by the slave, see
    /// [MailboxSupport](crate::registers::MailboxSupport)
    pub const protocols: u16 = 0x001c;
}

/// EEPROM size and SII version words
pub const size: u16 = 0x003e;

/// split a mailbox window word into its {offset, size} pair
pub fn mailbox_window(word: u32) -> (u16, u16) {
    (word as u16, (word >> 16) as u16)
}

/// byte size of the EEPROM: stored as KiBit - 1, so 0 means 1 KiBit
pub fn memory_size(word: u32) -> u32 {
    ((word & 0xff) + 1) * 128
}

/// version of the SII layout
pub fn memory_version(word: u32) -> u16 {
    (word >> 16) as u16
}
