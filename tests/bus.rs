//! end-to-end scenarios of the master against a simulated segment

mod simulator;

use etherbus::mailbox::{Message, MessageHandle};
use etherbus::{AlState, Bus, EthercatError, Link, MessageStatus};
use simulator::{DeadSocket, Segment, SimSlave, SimSocket};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn bus_with(slaves: Vec<SimSlave>) -> (Bus<SimSocket>, Rc<RefCell<Segment>>) {
    let segment = Rc::new(RefCell::new(Segment::new(slaves)));
    let bus = Bus::new(Link::new(SimSocket::new(segment.clone())));
    (bus, segment)
}

/// run acyclic cycles until the transfer leaves the running state
async fn drive(bus: &mut Bus<SimSocket>, handle: &MessageHandle) -> MessageStatus {
    for _ in 0 .. 16 {
        bus.exchange_mailboxes().await.unwrap();
        let status = handle.lock().unwrap().status();
        if status != MessageStatus::Running {
            return status;
        }
    }
    panic!("the transfer did not finish");
}

#[tokio::test]
async fn discovery_of_three_slaves() {
    let (mut bus, _) = bus_with(vec![
        SimSlave::new(0xe0ca_0001, 0x0101, 128),
        SimSlave::new(0xe0ca_0002, 0x0102, 128),
        SimSlave::new(0xe0ca_0003, 0x0103, 128),
    ]);
    bus.init().await.unwrap();

    assert_eq!(bus.slaves().len(), 3);
    let addresses: Vec<_> = bus.slaves().iter().map(|slave| slave.address).collect();
    assert_eq!(addresses, [0x1000, 0x1001, 0x1002]);

    for (position, slave) in bus.slaves().iter().enumerate() {
        assert_eq!(slave.vendor_id, 0xe0ca_0001 + position as u32);
        assert_eq!(slave.product_code, 0x0101 + position as u32);
        assert!(slave.supported_mailbox.coe());
        assert_eq!(slave.mailbox.config.recv_offset, simulator::MAILBOX_WRITE);
        assert_eq!(slave.mailbox.config.send_offset, simulator::MAILBOX_READ);
        assert_eq!(slave.mailbox.config.recv_size, 128);
        assert_eq!(slave.eeprom_size, 2048);
        assert_eq!(slave.eeprom_version, 1);
    }
    for address in addresses {
        assert_eq!(bus.current_state(address).await.unwrap(), AlState::PreOperational);
    }
}

#[tokio::test]
async fn eeprom_busy_then_ready() {
    let mut slaves = Vec::new();
    for position in 0 .. 3 {
        let mut slave = SimSlave::new(0x100 + position, 1, 128);
        // the first two readiness polls report busy, the third is clear
        slave.busy_polls = 2;
        slaves.push(slave);
    }
    let (mut bus, _) = bus_with(slaves);
    bus.init().await.unwrap();

    let calls = Cell::new(0);
    bus.read_eeprom(0x0008, |_, _| calls.set(calls.get() + 1)).await.unwrap();
    assert_eq!(calls.get(), 3);
}

#[tokio::test]
async fn eeprom_reads_are_idempotent() {
    let (mut bus, _) = bus_with(vec![SimSlave::new(0xcafe_f00d, 1, 128)]);
    bus.init().await.unwrap();

    let first = Cell::new(0);
    bus.read_eeprom(0x0008, |_, word| first.set(word)).await.unwrap();
    let second = Cell::new(0);
    bus.read_eeprom(0x0008, |_, word| second.set(word)).await.unwrap();
    assert_eq!(first.get(), 0xcafe_f00d);
    assert_eq!(first.get(), second.get());
}

#[tokio::test]
async fn transport_timeout_aborts_init() {
    let mut bus = Bus::new(Link::with_timeout(DeadSocket, Duration::from_millis(1)));
    assert!(matches!(bus.init().await, Err(EthercatError::Timeout(_))));
}

#[tokio::test]
async fn expedited_sdo_upload() {
    let mut slave = SimSlave::new(2, 2, 128);
    slave.dictionary.insert((0x1018, 1), vec![0xef, 0xbe, 0xad, 0xde]);
    let (mut bus, _) = bus_with(vec![slave]);
    bus.init().await.unwrap();

    let handle = bus.slaves_mut()[0].mailbox.sdo_upload(0x1018, 1, false, 4);
    let status = drive(&mut bus, &handle).await;
    assert_eq!(status, MessageStatus::Success);

    let message = handle.lock().unwrap();
    let Message::Sdo(sdo) = &*message else { panic!("not an sdo transfer") };
    assert_eq!(sdo.received(), [0xef, 0xbe, 0xad, 0xde]);
    assert_eq!(sdo.data_size(), 4);
    drop(message);
    assert_eq!(bus.slaves()[0].mailbox.pending(), 0);
}

#[tokio::test]
async fn segmented_sdo_upload() {
    let value: Vec<u8> = (0 .. 10).collect();
    let mut slave = SimSlave::new(3, 3, 16);
    slave.dictionary.insert((0x6041, 0), value.clone());
    let (mut bus, _) = bus_with(vec![slave]);
    bus.init().await.unwrap();

    // 10 bytes over a 16-byte mailbox: two segment round-trips
    let handle = bus.slaves_mut()[0].mailbox.sdo_upload(0x6041, 0, false, 16);
    let status = drive(&mut bus, &handle).await;
    assert_eq!(status, MessageStatus::Success);

    let message = handle.lock().unwrap();
    let Message::Sdo(sdo) = &*message else { panic!("not an sdo transfer") };
    assert_eq!(sdo.data_size(), 10);
    assert_eq!(sdo.received(), value);
}

#[tokio::test]
async fn sdo_downloads_in_every_form() {
    let (mut bus, _) = bus_with(vec![SimSlave::new(4, 4, 20)]);
    bus.init().await.unwrap();

    // expedited
    let handle = bus.slaves_mut()[0].mailbox.sdo_download(0x6040, 0, false, &[0x06, 0x00]);
    assert_eq!(drive(&mut bus, &handle).await, MessageStatus::Success);

    // segmented: 10 bytes over a 20-byte mailbox
    let value: Vec<u8> = (0 .. 10).collect();
    let handle = bus.slaves_mut()[0].mailbox.sdo_download(0x1c12, 0, false, &value);
    assert_eq!(drive(&mut bus, &handle).await, MessageStatus::Success);
    assert_eq!(bus.slaves()[0].mailbox.pending(), 0);
}

#[tokio::test]
async fn sdo_abort_surfaces_and_unqueues() {
    let mut slave = SimSlave::new(5, 5, 128);
    slave.abort_code = Some(0x0602_0000);
    let (mut bus, _) = bus_with(vec![slave]);
    bus.init().await.unwrap();

    let handle = bus.slaves_mut()[0].mailbox.sdo_upload(0x1018, 1, false, 4);
    let status = drive(&mut bus, &handle).await;
    assert_eq!(status, MessageStatus::Abort(0x0602_0000));
    assert_eq!(bus.slaves()[0].mailbox.pending(), 0);
}

#[tokio::test]
async fn emergency_lands_in_the_ring() {
    let (mut bus, segment) = bus_with(vec![SimSlave::new(6, 6, 128)]);
    bus.init().await.unwrap();

    let watcher = bus.slaves_mut()[0].mailbox.install_emergency();
    segment.borrow_mut().slaves[0].emergency = Some(0x1000);
    for _ in 0 .. 4 {
        bus.exchange_mailboxes().await.unwrap();
    }

    let mailbox = &bus.slaves()[0].mailbox;
    assert_eq!(mailbox.emergencies.len(), 1);
    assert_eq!(mailbox.emergencies[0].error_code, 0x1000);
    assert_eq!(mailbox.emergencies[0].error_register, 0x04);
    assert_eq!(mailbox.emergencies[0].data, [1, 2, 3, 4, 5]);
    // the watcher outlives the capture
    assert_eq!(mailbox.pending(), 1);
    assert_eq!(watcher.lock().unwrap().status(), MessageStatus::Running);
}
