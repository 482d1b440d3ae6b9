use crate::{command::Command, Error};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Timed out waiting for the instrument")]
    Timeout,
    #[error("Instrument disconnected")]
    Disconnected,
    #[error("USBTMC transfer failed")]
    UsbTmc(#[from] crate::usbtmc::Error),
    #[error("Returned string was not valid UTF8")]
    BadString(#[from] std::string::FromUtf8Error),
}

/// An exclusive request/response channel to the instrument.
///
/// Implementations must not pipeline: every `write` of a query is followed by
/// exactly one `read` or `read_raw` before the next command goes out.
pub trait Transport {
    /// Send one command string
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read one terminated text reply, without its trailing newline
    fn read(&mut self) -> Result<String, TransportError>;

    /// Read one reply as raw bytes, binary-safe
    fn read_raw(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Write a command and read its text reply
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;
        self.read()
    }
}

/// Send a command, attaching it to any transport failure
pub(crate) fn send<T: Transport + ?Sized>(
    transport: &mut T,
    command: &Command,
) -> crate::Result<()> {
    let line = command.to_string();
    tracing::debug!(command = %line, "write");
    transport
        .write(&line)
        .map_err(|source| Error::Transport { command: line, source })
}

/// Send a query and read back its text reply
pub(crate) fn ask<T: Transport + ?Sized>(
    transport: &mut T,
    command: &Command,
) -> crate::Result<String> {
    send(transport, command)?;
    let reply = transport.read().map_err(|source| Error::Transport {
        command: command.to_string(),
        source,
    })?;
    tracing::debug!(bytes = reply.len(), "read");
    Ok(reply)
}

/// Send a query and read back its reply as raw bytes
pub(crate) fn ask_raw<T: Transport + ?Sized>(
    transport: &mut T,
    command: &Command,
) -> crate::Result<Vec<u8>> {
    send(transport, command)?;
    let reply = transport.read_raw().map_err(|source| Error::Transport {
        command: command.to_string(),
        source,
    })?;
    tracing::debug!(bytes = reply.len(), "read_raw");
    Ok(reply)
}
