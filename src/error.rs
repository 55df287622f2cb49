//! definition of the general ethercat error type

use core::fmt;
use std::sync::Arc;

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variants are meant to help finding the cause responsible for the problem
    and how to deal with it.

    [Self::Slave] should not be used without an appropriate type for `T`: it
    depends on the operation reporting the error and is usually an error code or
    an enum.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by the communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a slave, its type depends on the operation returning it
    ///
    /// these errors can generally be fixed by retrying the operation or
    /// reconfiguring the slave
    Slave(T),

    /// error reported by the master, usually caused by a wrong use of the library
    Master(&'static str),

    /// error detected by the master in the ethercat communication itself
    ///
    /// these errors can generally not be fixed and the communication has to be
    /// restarted
    Protocol(&'static str),

    /// too much time elapsed, but the communication is not compromised
    ///
    /// the operation can generally be retried
    Timeout(&'static str),

    /// a datagram came back with fewer acting slaves than expected
    WorkingCounter {
        expected: u16,
        received: u16,
    },
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Slave(detail) => write!(f, "slave: {:?}", detail),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Protocol(message) => write!(f, "protocol: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
            Self::WorkingCounter { expected, received } =>
                write!(f, "working counter: expected {}, received {}", expected, received),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// rust already implements `From<T> for T` so smart conversions of the generic
// variant cannot be blanket-implemented, hence these manual adapters
impl<E> EthercatError<E> {
    /// convert the error if the slave-specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(F::from)
    }
    /// convert the error with a callback handling the slave-specific variant
    pub fn map<F, T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(value) => EthercatError::Slave(callback(value)),
            EthercatError::Io(error) => EthercatError::Io(error),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::WorkingCounter { expected, received } =>
                EthercatError::WorkingCounter { expected, received },
        }
    }
}

impl EthercatError<()> {
    /// give a slave-specific error type to an error that has none
    pub fn upgrade<F>(self) -> EthercatError<F> {
        self.map(|_| unreachable!("error with no slave-specific type cannot report a slave error"))
    }
}
