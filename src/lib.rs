/*!
    Etherbus is a crate implementing the core of an EtherCAT master: the
    datagram pipeline and the acyclic (mailbox) state machines.

    The master drives a segment of slaves over a raw ethernet link (or UDP). It
    discovers the chain, resets and addresses every slave, reads the identities
    from the on-device EEPROMs, configures the mailbox sync managers, walks the
    slaves through the EtherCAT state machine, and shepherds CoE SDO transfers
    and emergency reports through the per-slave mailboxes.

    ## Main features

    - [Bus] for the whole bring-up sequence and the acyclic exchanges
    - [Pipeline](pipeline::Pipeline) packing multiple datagrams per ethercat
      frame, with replies handed back strictly in issue order
    - [Mailbox](mailbox::Mailbox) per-slave message queues and session counters
    - [SdoMessage] segmented CoE SDO upload/download
    - [EmergencyMessage] out-of-band emergency capture

    ## Scope

    Process-data (cyclic PDO) exchange, distributed-clock synchronization and
    redundancy are not part of this core. The raw transport is behind the
    [EthercatSocket] trait: opening the raw socket needs `CAP_NET_RAW` on
    linux, which is a runtime precondition of the program embedding this crate.

    The whole crate is `async` but single-driver: at most one frame is on the
    wire at a time and nothing here spawns tasks.
*/

pub mod data;
pub mod error;
#[allow(non_upper_case_globals)]
pub mod registers;
#[allow(non_upper_case_globals)]
pub mod eeprom;
pub mod frame;
pub mod socket;
pub mod link;
pub mod pipeline;
pub mod slave;
pub mod mailbox;
pub mod can;
pub mod bus;

pub use crate::bus::Bus;
pub use crate::can::{Emergency, EmergencyMessage, SdoDirection, SdoMessage};
pub use crate::data::{Field, PduData};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::frame::PduCommand;
pub use crate::link::Link;
pub use crate::mailbox::{Mailbox, MessageStatus};
pub use crate::registers::AlState;
pub use crate::slave::Slave;
pub use crate::socket::{EthercatSocket, EthernetSocket, UdpSocket};
