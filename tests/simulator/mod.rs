//! scripted ethercat segment: a chain of simulated slaves behind a socket,
//! processing every datagram the way real hardware would on the fly

use etherbus::socket::EthercatSocket;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

// datagram commands
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;

// registers
const STATION_ADDR: u16 = 0x0010;
const AL_CONTROL: u16 = 0x0120;
const AL_STATUS: u16 = 0x0130;
const EEPROM_CONTROL: u16 = 0x0502;
const EEPROM_DATA: u16 = 0x0508;
const SM0_STATUS: u16 = 0x0805;
const SM1_STATUS: u16 = 0x080d;

// eeprom words
const EEPROM_VENDOR: u16 = 0x0008;
const EEPROM_PRODUCT: u16 = 0x000a;
const EEPROM_REVISION: u16 = 0x000c;
const EEPROM_SERIAL: u16 = 0x000e;
const EEPROM_BOOT_RECV: u16 = 0x0014;
const EEPROM_BOOT_SEND: u16 = 0x0016;
const EEPROM_STD_RECV: u16 = 0x0018;
const EEPROM_STD_SEND: u16 = 0x001a;
const EEPROM_PROTOCOLS: u16 = 0x001c;
const EEPROM_SIZE: u16 = 0x003e;

/// where the simulated slaves map their mailbox windows
pub const MAILBOX_WRITE: u16 = 0x1000;
pub const MAILBOX_READ: u16 = 0x1400;

/// ongoing segmented upload on the server side
struct UploadState {
    data: Vec<u8>,
    sent: usize,
    toggle: bool,
}

/// one simulated slave
pub struct SimSlave {
    station: u16,
    al_status: u16,
    mailbox_size: u16,

    eeprom: HashMap<u16, u32>,
    eeprom_address: u16,
    eeprom_busy: u8,
    /// polls that will report busy after each eeprom request
    pub busy_polls: u8,

    /// CoE object dictionary served on SDO upload
    pub dictionary: HashMap<(u16, u8), Vec<u8>>,
    /// when set, every SDO request is answered with this abort code
    pub abort_code: Option<u32>,
    /// when set, an emergency with this error code is emitted once
    pub emergency: Option<u16>,

    upload: Option<UploadState>,
    out_message: Option<Vec<u8>>,
}

impl SimSlave {
    pub fn new(vendor: u32, product: u32, mailbox_size: u16) -> Self {
        let window = |offset: u16| u32::from(offset) | u32::from(mailbox_size) << 16;
        let eeprom = HashMap::from([
            (EEPROM_VENDOR, vendor),
            (EEPROM_PRODUCT, product),
            (EEPROM_REVISION, 0x0001_0000),
            (EEPROM_SERIAL, 0x0badc0de),
            (EEPROM_BOOT_RECV, window(MAILBOX_WRITE)),
            (EEPROM_BOOT_SEND, window(MAILBOX_READ)),
            (EEPROM_STD_RECV, window(MAILBOX_WRITE)),
            (EEPROM_STD_SEND, window(MAILBOX_READ)),
            // CoE only
            (EEPROM_PROTOCOLS, 0x0004),
            // 16 KiBit part, layout version 1
            (EEPROM_SIZE, 0x0001_000f),
        ]);
        Self {
            station: 0,
            al_status: 0x1,
            mailbox_size,
            eeprom,
            eeprom_address: 0,
            eeprom_busy: 0,
            busy_polls: 0,
            dictionary: HashMap::new(),
            abort_code: None,
            emergency: None,
            upload: None,
            out_message: None,
        }
    }

    fn read(&mut self, ado: u16, data: &mut [u8]) {
        match ado {
            AL_STATUS => data[.. 2].copy_from_slice(&self.al_status.to_le_bytes()),
            EEPROM_CONTROL => {
                let status: u16 = if self.eeprom_busy > 0 {
                    self.eeprom_busy -= 1;
                    0x8000
                } else { 0 };
                data[.. 2].copy_from_slice(&status.to_le_bytes());
            }
            EEPROM_DATA => {
                let word = self.eeprom.get(&self.eeprom_address).copied().unwrap_or(0);
                data[.. 4].copy_from_slice(&word.to_le_bytes());
            }
            SM0_STATUS => data[0] = 0,
            SM1_STATUS => {
                // a quiet slave takes the chance to report a pending emergency
                if self.out_message.is_none() {
                    if let Some(code) = self.emergency.take() {
                        let mut content = vec![0x00, 0x10];
                        content.extend_from_slice(&code.to_le_bytes());
                        content.push(0x04);
                        content.extend_from_slice(&[1, 2, 3, 4, 5]);
                        self.out_message = Some(mailbox_message(0, content));
                    }
                }
                data[0] = if self.out_message.is_some() { 0x08 } else { 0 };
            }
            MAILBOX_READ => {
                if let Some(message) = self.out_message.take() {
                    let length = message.len().min(data.len());
                    data[.. length].copy_from_slice(&message[.. length]);
                }
            }
            _ => data.fill(0),
        }
    }

    fn write(&mut self, ado: u16, data: &[u8]) {
        match ado {
            STATION_ADDR => self.station = u16::from_le_bytes([data[0], data[1]]),
            AL_CONTROL => self.al_status = u16::from_le_bytes([data[0], data[1]]) & 0xf,
            EEPROM_CONTROL => {
                if data.len() >= 6 {
                    let control = u16::from_le_bytes([data[0], data[1]]);
                    // read operation request
                    if control & 0x0100 != 0 {
                        self.eeprom_address = u16::from_le_bytes([data[2], data[3]]);
                        self.eeprom_busy = self.busy_polls;
                    }
                }
            }
            MAILBOX_WRITE => self.mailbox(data),
            _ => (),
        }
    }

    /// act on a mailbox message freshly written by the master
    fn mailbox(&mut self, data: &[u8]) {
        if data.len() < 8 {
            return;
        }
        let ty = data[5] & 0xf;
        let count = (data[5] >> 4) & 0x7;
        let service = data[7] >> 4;
        // only CoE SDO requests are simulated
        if ty != 3 || service != 2 {
            return;
        }
        if let Some(code) = self.abort_code {
            let mut content = vec![4 << 5, data[9], data[10], data[11]];
            content.extend_from_slice(&code.to_le_bytes());
            self.out_message = Some(mailbox_message(count, with_coe(2, content)));
            return;
        }
        let command = data[8] >> 5;
        match command {
            // download initiate: acknowledge
            1 => {
                let content = vec![3 << 5, data[9], data[10], data[11], 0, 0, 0, 0];
                self.out_message = Some(mailbox_message(count, with_coe(3, content)));
            }
            // download segment: echo the toggle
            0 => {
                let content = vec![1 << 5 | data[8] & 0x10, 0, 0, 0, 0, 0, 0, 0];
                self.out_message = Some(mailbox_message(count, with_coe(3, content)));
            }
            // upload initiate
            2 => {
                let index = u16::from_le_bytes([data[9], data[10]]);
                let sub = data[11];
                let value = match self.dictionary.get(&(index, sub)) {
                    Some(value) => value.clone(),
                    None => {
                        // entry does not exist
                        let mut content = vec![4 << 5, data[9], data[10], data[11]];
                        content.extend_from_slice(&0x0602_0000u32.to_le_bytes());
                        self.out_message = Some(mailbox_message(count, with_coe(2, content)));
                        return;
                    }
                };
                if value.len() <= 4 {
                    // expedited
                    let mut content = vec![
                        2 << 5 | (4 - value.len() as u8) << 2 | 0x03,
                        data[9], data[10], data[11],
                    ];
                    let mut expedited = [0; 4];
                    expedited[.. value.len()].copy_from_slice(&value);
                    content.extend_from_slice(&expedited);
                    self.out_message = Some(mailbox_message(count, with_coe(3, content)));
                } else {
                    // normal announce, the bytes follow in segments
                    let mut content = vec![2 << 5 | 0x01, data[9], data[10], data[11]];
                    content.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    self.upload = Some(UploadState { data: value, sent: 0, toggle: false });
                    self.out_message = Some(mailbox_message(count, with_coe(3, content)));
                }
            }
            // upload segment
            3 => {
                let Some(state) = self.upload.as_mut() else { return };
                let capacity = usize::from(self.mailbox_size) - 9;
                let remaining = state.data.len() - state.sent;
                let chunk = remaining.min(capacity);
                let last = chunk == remaining;
                let padding = 7usize.saturating_sub(chunk);
                let mut content = vec![
                    u8::from(last) | (padding as u8) << 1 | u8::from(state.toggle) << 4,
                ];
                content.extend_from_slice(&state.data[state.sent ..][.. chunk]);
                content.extend_from_slice(&vec![0; padding]);
                state.sent += chunk;
                state.toggle = !state.toggle;
                if last {
                    self.upload = None;
                }
                self.out_message = Some(mailbox_message(count, with_coe(3, content)));
            }
            _ => (),
        }
    }
}

/// prepend a CoE header with the given service to the content
fn with_coe(service: u8, content: Vec<u8>) -> Vec<u8> {
    let mut framed = vec![0x00, service << 4];
    framed.extend(content);
    framed
}

/// wrap CoE content in a mailbox message of type CoE with the given counter
fn mailbox_message(count: u8, content: Vec<u8>) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(&(content.len() as u16).to_le_bytes());
    message.extend_from_slice(&[0, 0, 0]);
    message.push(count << 4 | 0x3);
    message.extend(content);
    message
}

/// the slave chain
pub struct Segment {
    pub slaves: Vec<SimSlave>,
}

impl Segment {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self { slaves }
    }

    /// process one datagram like the chain would, returning the working counter
    fn datagram(&mut self, command: u8, adp: u16, ado: u16, payload: &mut [u8]) -> u16 {
        let mut wkc = 0;
        match command {
            BRD => for slave in &mut self.slaves {
                slave.read(ado, payload);
                wkc += 1;
            },
            BWR => for slave in &mut self.slaves {
                slave.write(ado, payload);
                wkc += 1;
            },
            APRW => for (position, slave) in self.slaves.iter_mut().enumerate() {
                if adp == 0u16.wrapping_sub(position as u16) {
                    slave.write(ado, payload);
                    slave.read(ado, payload);
                    wkc += 3;
                }
            },
            FPRD => for slave in &mut self.slaves {
                if slave.station == adp {
                    slave.read(ado, payload);
                    wkc += 1;
                }
            },
            FPWR => for slave in &mut self.slaves {
                if slave.station == adp {
                    slave.write(ado, payload);
                    wkc += 1;
                }
            },
            FPRW => for slave in &mut self.slaves {
                if slave.station == adp {
                    slave.write(ado, payload);
                    slave.read(ado, payload);
                    wkc += 3;
                }
            },
            _ => (),
        }
        wkc
    }

    /// walk the datagrams of a whole frame
    fn frame(&mut self, frame: &mut [u8]) {
        let mut position = 2;
        loop {
            let command = frame[position];
            let address = u32::from_le_bytes([
                frame[position + 2], frame[position + 3],
                frame[position + 4], frame[position + 5],
            ]);
            let word = u16::from_le_bytes([frame[position + 6], frame[position + 7]]);
            let length = usize::from(word & 0x7ff);
            let multiple = word & 0x8000 != 0;

            let wkc = {
                let payload = &mut frame[position + 10 .. position + 10 + length];
                self.datagram(command, address as u16, (address >> 16) as u16, payload)
            };
            frame[position + 10 + length .. position + 12 + length]
                .copy_from_slice(&wkc.to_le_bytes());

            position += 12 + length;
            if !multiple {
                break;
            }
        }
    }
}

/// socket putting frames through a [Segment] instead of a wire
pub struct SimSocket {
    segment: Rc<RefCell<Segment>>,
    pending: RefCell<VecDeque<Vec<u8>>>,
}

impl SimSocket {
    pub fn new(segment: Rc<RefCell<Segment>>) -> Self {
        Self {
            segment,
            pending: RefCell::new(VecDeque::new()),
        }
    }
}

impl EthercatSocket for SimSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<usize> {
        match self.pending.borrow_mut().pop_front() {
            Some(frame) => {
                let length = frame.len().min(data.len());
                data[.. length].copy_from_slice(&frame[.. length]);
                Ok(length)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut frame = data.to_vec();
        self.segment.borrow_mut().frame(&mut frame);
        self.pending.borrow_mut().push_back(frame);
        Ok(())
    }

    fn max_frame(&self) -> usize {
        1500
    }
}

/// socket behind which nothing answers
pub struct DeadSocket;

impl EthercatSocket for DeadSocket {
    fn receive(&self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }
    fn send(&self, _: &[u8]) -> io::Result<()> {
        Ok(())
    }
    fn max_frame(&self) -> usize {
        1500
    }
}
