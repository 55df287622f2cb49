/*!
    the bus controller: it owns the slave list and the datagram pipeline, and
    sequences every multi-stage operation of the master over them

    All methods rely on the positional reply order guaranteed by the
    [Pipeline]: one reply datagram per appended datagram, in append order.
*/

use crate::data::{Field, PduData};
use crate::eeprom;
use crate::error::{EthercatError, EthercatResult};
use crate::frame::{pdu_address, PduCommand, MAX_DATAGRAMS};
use crate::link::Link;
use crate::mailbox::MessageHandle;
use crate::pipeline::Pipeline;
use crate::registers::{self, AlState};
use crate::slave::Slave;
use crate::socket::EthercatSocket;
use std::time::Duration;
use tokio::time::sleep;


/// first station address assigned during bring-up
const BASE_ADDRESS: u16 = 0x1000;
/// spacing of the EEPROM readiness polls
const EEPROM_POLL: Duration = Duration::from_micros(200);
/// EEPROM readiness polls before giving up
const EEPROM_RETRIES: usize = 10;
/// settle delay after an AL state request, before checking the outcome
const STATE_SETTLE: Duration = Duration::from_millis(10);
/// state polls before giving up on a transition
const STATE_RETRIES: usize = 100;

/**
    master side of one ethercat segment

    [Self::init] walks the whole bring-up sequence; afterwards the slave list is
    exposed for acyclic messaging through [Self::exchange_mailboxes].
*/
pub struct Bus<S: EthercatSocket> {
    pipeline: Pipeline<S>,
    slaves: Vec<Slave>,
}

impl<S: EthercatSocket> Bus<S> {
    pub fn new(link: Link<S>) -> Self {
        Self {
            pipeline: Pipeline::new(link),
            slaves: Vec::new(),
        }
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    /**
        bring the segment up: discover the chain, reset and address every slave,
        read the identities from the EEPROMs, configure the mailboxes and bring
        everyone to PRE-OP

        Each stage is fatal on error; the caller may inspect and restart.
    */
    pub async fn init(&mut self) -> EthercatResult<()> {
        self.detect_slaves().await?;
        self.reset_slaves().await?;
        self.assign_addresses().await?;
        self.fetch_eeprom().await?;
        self.configure_mailboxes().await?;
        self.request_state(AlState::PreOperational).await?;
        self.wait_state(AlState::PreOperational).await?;
        Ok(())
    }

    /// one broadcast read, returning the working counter
    async fn broadcast_read<T: PduData>(&mut self, field: Field<T>) -> EthercatResult<u16> {
        let zeros = [0; 256];
        self.pipeline.add_datagram(PduCommand::Brd, pdu_address(0, field.byte as u16), &zeros[.. field.len])?;
        self.pipeline.process_frames().await?;
        let (_, _, wkc) = self.pipeline.next_datagram_raw()?;
        Ok(wkc)
    }

    /// one broadcast write, returning the working counter
    async fn broadcast_write<T: PduData>(&mut self, field: Field<T>, value: T) -> EthercatResult<u16> {
        let mut buffer = [0; 256];
        value.pack(&mut buffer[.. field.len])?;
        self.pipeline.add_datagram(PduCommand::Bwr, pdu_address(0, field.byte as u16), &buffer[.. field.len])?;
        self.pipeline.process_frames().await?;
        let (_, _, wkc) = self.pipeline.next_datagram_raw()?;
        Ok(wkc)
    }

    /// probe the chain: the working counter of a broadcast read is the number
    /// of slaves on the segment
    async fn detect_slaves(&mut self) -> EthercatResult<()> {
        // the register content does not matter, only the working counter does
        let count = self.broadcast_read(registers::esc_type).await?;
        if count == 0 {
            return Err(EthercatError::Master("no slave detected on the segment"));
        }
        self.slaves = (0 .. count).map(|_| Slave::new()).collect();
        // enough frames to issue two datagrams per slave in a single batch,
        // with the same amount again as spare
        let datagrams = 2 * usize::from(count);
        self.pipeline.reserve(2 * ((datagrams + MAX_DATAGRAMS - 1) / MAX_DATAGRAMS));
        Ok(())
    }

    /// put every slave back in a known configuration
    ///
    /// Some reset registers are optional in the ESC specification, so the
    /// working counters are not checked here.
    async fn reset_slaves(&mut self) -> EthercatResult<()> {
        // ports back to automatic loop control
        self.broadcast_write(registers::dl::port, 0).await?;
        // clear the error counters and both configuration units
        self.broadcast_write(registers::ports_errors, registers::PortsErrorCount::from(0)).await?;
        self.broadcast_write(registers::fmmu::entries, [0; 256]).await?;
        self.broadcast_write(registers::sync_manager::entries, [0; 128]).await?;
        // silence the distributed clock
        self.broadcast_write(registers::dc::system_time, 0).await?;
        self.broadcast_write(registers::dc::sync_activation, 0).await?;
        self.broadcast_write(registers::dc::speed_count_start, 0x1000).await?;
        self.broadcast_write(registers::dc::time_filter, 0x0c00).await?;

        self.request_state(AlState::Init).await?;

        // hand the EEPROM interface over to the master
        self.broadcast_write(registers::sii::access,
            registers::SiiAccess::new(registers::SiiOwner::EthercatDL, false, false)).await?;
        Ok(())
    }

    /// give the slave at topological position `i` the station address
    /// `BASE_ADDRESS + i`, used by every addressed command afterwards
    async fn assign_addresses(&mut self) -> EthercatResult<()> {
        let Self { slaves, pipeline } = self;
        for (position, slave) in slaves.iter_mut().enumerate() {
            slave.address = BASE_ADDRESS + position as u16;
            let mut value = [0; 2];
            slave.address.pack(&mut value)?;
            // position i on the chain answers to auto-increment address -i
            pipeline.add_datagram(
                PduCommand::Aprw,
                pdu_address(0u16.wrapping_sub(position as u16), registers::address::fixed.byte as u16),
                &value,
            )?;
        }
        pipeline.process_frames().await?;
        for _ in 0 .. slaves.len() {
            let (_, _, wkc) = pipeline.next_datagram::<u16>()?;
            if wkc < 1 {
                return Err(EthercatError::WorkingCounter { expected: 1, received: wkc });
            }
        }
        Ok(())
    }

    /// collect identity, mailbox recommendations and memory geometry from
    /// every slave EEPROM
    async fn fetch_eeprom(&mut self) -> EthercatResult<()> {
        self.read_eeprom(eeprom::device::vendor, |slave, word| slave.vendor_id = word).await?;
        self.read_eeprom(eeprom::device::product, |slave, word| slave.product_code = word).await?;
        self.read_eeprom(eeprom::device::revision, |slave, word| slave.revision_number = word).await?;
        self.read_eeprom(eeprom::device::serial_number, |slave, word| slave.serial_number = word).await?;

        self.read_eeprom(eeprom::mailbox::standard::recv, |slave, word| {
            let (offset, size) = eeprom::mailbox_window(word);
            slave.mailbox.config.recv_offset = offset;
            slave.mailbox.config.recv_size = size;
        }).await?;
        self.read_eeprom(eeprom::mailbox::standard::send, |slave, word| {
            let (offset, size) = eeprom::mailbox_window(word);
            slave.mailbox.config.send_offset = offset;
            slave.mailbox.config.send_size = size;
        }).await?;
        self.read_eeprom(eeprom::mailbox::bootstrap::recv, |slave, word| {
            let (offset, size) = eeprom::mailbox_window(word);
            slave.mailbox_bootstrap.recv_offset = offset;
            slave.mailbox_bootstrap.recv_size = size;
        }).await?;
        self.read_eeprom(eeprom::mailbox::bootstrap::send, |slave, word| {
            let (offset, size) = eeprom::mailbox_window(word);
            slave.mailbox_bootstrap.send_offset = offset;
            slave.mailbox_bootstrap.send_size = size;
        }).await?;
        self.read_eeprom(eeprom::mailbox::protocols, |slave, word| {
            slave.supported_mailbox = registers::MailboxSupport::from(word as u16);
        }).await?;

        self.read_eeprom(eeprom::size, |slave, word| {
            slave.eeprom_size = eeprom::memory_size(word);
            slave.eeprom_version = eeprom::memory_version(word);
        }).await?;
        Ok(())
    }

    /**
        read the same EEPROM word from every slave and apply it

        The read request is broadcast, then the readiness of every EEPROM is
        polled, then the data registers are collected in one batch and `apply`
        is called once per slave.
    */
    pub async fn read_eeprom(&mut self, word: u16, apply: impl Fn(&mut Slave, u32)) -> EthercatResult<()> {
        let request = registers::SiiControlAddress::new(
            {
                let mut control = registers::SiiControl::default();
                control.set_read_operation(true);
                control
            },
            u32::from(word),
        );
        let answers = self.broadcast_write(registers::sii::control_address, request).await?;
        let expected = self.slaves.len() as u16;
        if answers != expected {
            return Err(EthercatError::WorkingCounter { expected, received: answers });
        }

        self.wait_eeprom().await?;

        let Self { slaves, pipeline } = self;
        for slave in slaves.iter() {
            pipeline.add_datagram(
                PduCommand::Fprd,
                pdu_address(slave.address, registers::sii::data.byte as u16),
                &[0; 4],
            )?;
        }
        pipeline.process_frames().await?;
        for slave in slaves.iter_mut() {
            let (_, word, wkc) = pipeline.next_datagram::<u32>()?;
            if wkc != 1 {
                log::warn!("slave {:#x} did not answer its eeprom word", slave.address);
                continue;
            }
            apply(slave, word);
        }
        Ok(())
    }

    /// poll every EEPROM until none reports busy anymore
    async fn wait_eeprom(&mut self) -> EthercatResult<()> {
        for _ in 0 .. EEPROM_RETRIES {
            sleep(EEPROM_POLL).await;
            let Self { slaves, pipeline } = self;
            for slave in slaves.iter() {
                pipeline.add_datagram(
                    PduCommand::Fprd,
                    pdu_address(slave.address, registers::sii::control.byte as u16),
                    &[0; 2],
                )?;
            }
            pipeline.process_frames().await?;
            let mut ready = true;
            for slave in slaves.iter() {
                let (_, control, wkc) = pipeline.next_datagram::<registers::SiiControl>()?;
                if wkc != 1 {
                    log::warn!("slave {:#x} did not answer its eeprom status", slave.address);
                }
                if control.busy() {
                    ready = false;
                }
            }
            if ready {
                return Ok(());
            }
            pipeline.discard();
        }
        Err(EthercatError::Timeout("eeprom not ready"))
    }

    /// write the mailbox sync manager channels of every slave implementing a
    /// mailbox protocol: SM0 receives from the master, SM1 sends to it
    async fn configure_mailboxes(&mut self) -> EthercatResult<()> {
        let Self { slaves, pipeline } = self;
        let mut configured = 0;
        for slave in slaves.iter() {
            if !slave.supported_mailbox.any() {
                continue;
            }
            let config = &slave.mailbox.config;
            let mut receive = registers::SyncManagerChannel::from(0);
            receive.set_address(config.recv_offset);
            receive.set_length(config.recv_size);
            receive.set_buffer_type(registers::SyncBufferType::Mailbox);
            receive.set_direction(registers::SyncBufferDirection::Write);
            receive.set_dls_user_event(true);
            receive.set_enable(true);

            let mut send = receive;
            send.set_address(config.send_offset);
            send.set_length(config.send_size);
            send.set_direction(registers::SyncBufferDirection::Read);

            let mut image = [0; 16];
            receive.pack(&mut image[.. 8])?;
            send.pack(&mut image[8 ..])?;
            pipeline.add_datagram(
                PduCommand::Fprw,
                pdu_address(slave.address, registers::sync_manager::interface.channel(0).byte as u16),
                &image,
            )?;
            configured += 1;
        }
        pipeline.process_frames().await?;
        for _ in 0 .. configured {
            let (_, _, wkc) = pipeline.next_datagram_raw()?;
            if wkc == 0 {
                log::warn!("a slave did not acknowledge its mailbox configuration");
            }
        }
        Ok(())
    }

    /// ask every slave at once to switch to the given state
    pub async fn request_state(&mut self, target: AlState) -> EthercatResult<()> {
        let control = registers::AlControl::new(target, true, false);
        let answers = self.broadcast_write(registers::al::control, control).await?;
        let expected = self.slaves.len() as u16;
        if answers != expected {
            return Err(EthercatError::WorkingCounter { expected, received: answers });
        }
        Ok(())
    }

    /// state the given slave is currently in
    pub async fn current_state(&mut self, slave: u16) -> EthercatResult<AlState> {
        self.pipeline.add_datagram(
            PduCommand::Fprd,
            pdu_address(slave, registers::al::status.byte as u16),
            &[0; 2],
        )?;
        self.pipeline.process_frames().await?;
        let (_, status, wkc) = self.pipeline.next_datagram::<registers::AlStatus>()?;
        if wkc != 1 {
            return Err(EthercatError::WorkingCounter { expected: 1, received: wkc });
        }
        Ok(status.state())
    }

    /// poll the whole segment until every slave reached the given state
    pub async fn wait_state(&mut self, target: AlState) -> EthercatResult<()> {
        for _ in 0 .. STATE_RETRIES {
            sleep(STATE_SETTLE).await;
            let Self { slaves, pipeline } = self;
            for slave in slaves.iter() {
                pipeline.add_datagram(
                    PduCommand::Fprd,
                    pdu_address(slave.address, registers::al::status.byte as u16),
                    &[0; 2],
                )?;
            }
            pipeline.process_frames().await?;
            let mut reached = true;
            for slave in slaves.iter() {
                let (_, status, wkc) = pipeline.next_datagram::<registers::AlStatus>()?;
                if wkc != 1 {
                    log::warn!("slave {:#x} did not answer its state", slave.address);
                    reached = false;
                    continue;
                }
                if status.error() {
                    return Err(EthercatError::Protocol("a slave refused the state transition"));
                }
                if status.state() != target {
                    reached = false;
                }
            }
            if reached {
                return Ok(());
            }
        }
        Err(EthercatError::Timeout("slaves did not reach the requested state"))
    }

    /**
        refresh the mailbox availability of every slave in one batch

        Failures here are logged and swallowed: a stale availability pair only
        delays the next message exchange.
    */
    pub async fn check_mailboxes(&mut self) {
        let Self { slaves, pipeline } = self;
        let interface = &registers::sync_manager::interface;
        for slave in slaves.iter() {
            for channel in [0, 1] {
                if let Err(error) = pipeline.add_datagram(
                    PduCommand::Fprd,
                    pdu_address(slave.address, interface.status(channel).byte as u16),
                    &[0; 1],
                ) {
                    log::warn!("cannot poll the mailbox states: {error}");
                    pipeline.discard();
                    return;
                }
            }
        }
        if let Err(error) = pipeline.process_frames().await {
            log::warn!("mailbox state poll failed: {error}");
            return;
        }
        for slave in slaves.iter_mut() {
            // SM0 full means the previous write was not consumed yet
            match pipeline.next_datagram::<registers::SyncManagerStatus>() {
                Ok((_, status, 1)) => slave.mailbox.config.write_available = !status.mailbox_full(),
                Ok(_) => log::debug!("slave {:#x} did not answer its receive mailbox state", slave.address),
                Err(error) => {
                    log::warn!("mailbox state poll failed: {error}");
                    return;
                }
            }
            // SM1 full means a message waits to be collected
            match pipeline.next_datagram::<registers::SyncManagerStatus>() {
                Ok((_, status, 1)) => slave.mailbox.config.read_available = status.mailbox_full(),
                Ok(_) => log::debug!("slave {:#x} did not answer its send mailbox state", slave.address),
                Err(error) => {
                    log::warn!("mailbox state poll failed: {error}");
                    return;
                }
            }
        }
    }

    /**
        run one acyclic communication cycle over the whole segment

        The mailbox states are refreshed, then at most one queued message per
        slave is written to its receive window and every pending reply is
        collected and dispatched to the transfer awaiting it. Call this
        repeatedly to drive SDO transfers to completion.
    */
    pub async fn exchange_mailboxes(&mut self) -> EthercatResult<()> {
        self.check_mailboxes().await;

        let Self { slaves, pipeline } = self;
        let mut written: Vec<(usize, MessageHandle)> = Vec::new();
        let mut reading: Vec<usize> = Vec::new();

        for (position, slave) in slaves.iter_mut().enumerate() {
            let config = slave.mailbox.config;
            if let Some(handle) = slave.mailbox.send() {
                // the sync manager only latches a write of the full window
                let mut image = vec![0; usize::from(config.recv_size)];
                if let Ok(message) = handle.lock() {
                    let data = message.data();
                    // messages are built within the mailbox size
                    let length = data.len().min(image.len());
                    image[.. length].copy_from_slice(&data[.. length]);
                }
                pipeline.add_datagram(
                    PduCommand::Fpwr,
                    pdu_address(slave.address, config.recv_offset),
                    &image,
                )?;
                written.push((position, handle));
            }
        }
        for (position, slave) in slaves.iter().enumerate() {
            let config = &slave.mailbox.config;
            if config.read_available {
                let window = vec![0; usize::from(config.send_size)];
                pipeline.add_datagram(
                    PduCommand::Fprd,
                    pdu_address(slave.address, config.send_offset),
                    &window,
                )?;
                reading.push(position);
            }
        }
        pipeline.process_frames().await?;

        for (position, handle) in written {
            let (_, _, wkc) = pipeline.next_datagram_raw()?;
            if wkc != 1 {
                let slave = &mut slaves[position];
                log::warn!("slave {:#x} did not take the mailbox write", slave.address);
                slave.mailbox.requeue(&handle);
            }
        }
        for position in reading {
            let slave = &mut slaves[position];
            let (_, payload, wkc) = pipeline.next_datagram_raw()?;
            if wkc != 1 {
                log::debug!("slave {:#x} did not deliver its mailbox message", slave.address);
                continue;
            }
            slave.mailbox.config.read_available = false;
            if let Err(error) = slave.mailbox.receive(payload) {
                log::warn!("slave {:#x} mailbox: {error}", slave.address);
            }
        }
        Ok(())
    }
}
