/*!
    exchange of one frame at a time over an [EthercatSocket]

    The link owns the timeout policy but never retransmits on its own: a lost
    frame surfaces as [EthercatError::Timeout] and the retry decision belongs to
    the caller.
*/

use crate::error::{EthercatError, EthercatResult};
use crate::frame::Frame;
use crate::socket::EthercatSocket;
use std::io;
use std::time::{Duration, Instant};


/// default reply timeout, suitable for a local wired segment
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2);
/// pause between two receive attempts while waiting for the reply
const RECEIVE_POLL: Duration = Duration::from_micros(50);

/// transport of ethercat frames with at most one frame on the wire at a time
pub struct Link<S: EthercatSocket> {
    socket: S,
    timeout: Duration,
}

impl<S: EthercatSocket> Link<S> {
    pub fn new(socket: S) -> Self {
        Self::with_timeout(socket, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(socket: S, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /**
        write the frame on the wire, then block until its reply image came back
        into the frame buffer or the timeout fired

        The segment echoes every frame after the last slave, so exactly one
        frame is expected back per frame sent.
    */
    pub async fn exchange(&self, frame: &mut Frame) -> EthercatResult<()> {
        {
            let image = frame.finish()?;
            self.socket.send(image)?;
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.socket.receive(frame.raw_mut()) {
                Ok(length) => break frame.received(length),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break Err(EthercatError::Timeout("no reply frame from the segment"));
                    }
                    tokio::time::sleep(RECEIVE_POLL).await;
                }
                Err(error) => break Err(error.into()),
            }
        }
    }
}
