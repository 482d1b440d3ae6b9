use crate::{
    command::Command,
    transport::{ask, Transport},
    Error, Result,
};
use bitflags::bitflags;
use parking_lot::RwLock;

/// Upper bound on error queries per drain, so a device that never reports
/// an empty queue cannot stall the acquisition loop
pub const MAX_ERROR_QUERIES: usize = 32;

bitflags! {
    /// IEEE 488.2 status byte, as returned by `*STB?`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusByte: u8 {
        /// The error/event queue holds at least one entry
        const ErrorAvailable = 0b0000_0100;
        const QuestionableStatus = 0b0000_1000;
        const MessageAvailable = 0b0001_0000;
        const EventStatus = 0b0010_0000;
        const RequestService = 0b0100_0000;
        const OperationStatus = 0b1000_0000;
        // The source may set any bits
        const _ = !0;
    }
}

impl StatusByte {
    /// Tests the error-available bit alone. Any status with bit 2 set counts,
    /// so 12 or 20 start a drain just as a bare 4 does, unlike a comparison
    /// of the reply text with `"4"`.
    pub fn has_pending_error(self) -> bool {
        self.contains(StatusByte::ErrorAvailable)
    }
}

/// Every raw reply to the error queue query, oldest first. Never cleared by
/// the driver.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: RwLock<Vec<String>>,
}

impl ErrorLog {
    pub fn push(&self, entry: String) {
        self.entries.write().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Split an error queue reply like `-113,"Undefined header";4` into its code
/// and message
pub fn parse_error_reply(reply: &str) -> Option<(i32, &str)> {
    let entry = reply.split(';').next()?;
    let (code, message) = entry.split_once(',')?;
    let code = code.trim().parse().ok()?;
    Some((code, message.trim().trim_matches('"')))
}

/// Pop the instrument's error queue until it reports no error.
///
/// Every reply is appended to `log`, including the final one. Returns the
/// number of queries issued.
pub fn drain_errors<T: Transport + ?Sized>(transport: &mut T, log: &ErrorLog) -> Result<usize> {
    for attempt in 1..=MAX_ERROR_QUERIES {
        let reply = ask(transport, &Command::ErrorStatus)?;
        let done = reply.starts_with('0');
        if !done {
            match parse_error_reply(&reply) {
                Some((code, message)) => {
                    tracing::warn!(code, description = message, "Instrument error")
                }
                None => tracing::warn!(reply = %reply, "Instrument error"),
            }
        }
        log.push(reply);
        if done {
            return Ok(attempt);
        }
    }
    tracing::error!("Error queue still not empty after {MAX_ERROR_QUERIES} queries");
    Err(Error::ErrorDrainExhausted {
        attempts: MAX_ERROR_QUERIES,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::loopback::LoopbackTransport;

    #[test]
    fn status_flags() {
        assert!(StatusByte::from_bits_retain(4).has_pending_error());
        assert!(StatusByte::from_bits_retain(0x24).has_pending_error());
        assert!(!StatusByte::from_bits_retain(0).has_pending_error());
        assert!(!StatusByte::from_bits_retain(0x10).has_pending_error());
        assert!(StatusByte::from_bits_retain(12).has_pending_error());
        assert!(StatusByte::from_bits_retain(20).has_pending_error());
    }

    #[test]
    fn error_reply_parsing() {
        assert_eq!(
            parse_error_reply("-113,\"Undefined header\";4"),
            Some((-113, "Undefined header"))
        );
        assert_eq!(parse_error_reply("0,\"No error\";0"), Some((0, "No error")));
        assert_eq!(parse_error_reply("garbage"), None);
    }

    #[test]
    fn drain_until_no_error() {
        let mut transport = LoopbackTransport::new();
        transport.push_text("-113,\"Undefined header\";4");
        transport.push_text("-222,\"Data out of range\";4");
        transport.push_text("0,\"No error\";0");
        let log = ErrorLog::default();

        let queries = drain_errors(&mut transport, &log).unwrap();
        assert_eq!(queries, 3);
        assert_eq!(log.len(), queries);
        assert_eq!(transport.count_written(":SYSTEM:ERROR?;*STB?"), 3);
        assert_eq!(log.entries()[2], "0,\"No error\";0");
    }

    #[test]
    fn drain_is_bounded() {
        let mut transport = LoopbackTransport::new();
        for _ in 0..MAX_ERROR_QUERIES + 5 {
            transport.push_text("-300,\"Device-specific error\";4");
        }
        let log = ErrorLog::default();
        assert!(matches!(
            drain_errors(&mut transport, &log),
            Err(Error::ErrorDrainExhausted { attempts }) if attempts == MAX_ERROR_QUERIES
        ));
        assert_eq!(log.len(), MAX_ERROR_QUERIES);
    }

    #[test]
    fn drain_propagates_transport_failure() {
        let mut transport = LoopbackTransport::new();
        transport.push_text("-113,\"Undefined header\";4");
        let log = ErrorLog::default();
        assert!(matches!(
            drain_errors(&mut transport, &log),
            Err(Error::Transport { .. })
        ));
        assert_eq!(log.len(), 1);
    }
}
