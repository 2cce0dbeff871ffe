//! Byte transport trait for the modem link

use crate::hardware::{LinkError, LinkResult};

/// Byte-oriented transport to the modem
///
/// The engine owns the driving logic but never the wire: implementations
/// wrap a serial port, a TCP bridge, or a test double. All read/write
/// operations must return immediately; implementations absorb their own
/// I/O errors and surface them as an empty read side.
pub trait ModemLink {
    /// Open the link at the given speed, closing any previous session
    fn open(&mut self, baud: u32) -> LinkResult<()>;

    /// Reopen at a new speed. Must be a no-op when the speed is unchanged
    /// so an in-progress byte is never interrupted.
    fn reopen(&mut self, baud: u32) -> LinkResult<()>;

    /// Queue raw bytes for transmission
    fn write_bytes(&mut self, data: &[u8]);

    /// Number of received bytes waiting to be read
    fn bytes_available(&self) -> usize;

    /// Read one received byte, if any
    fn read_byte(&mut self) -> Option<u8>;

    /// Speed the link is currently open at, if open
    fn current_baud(&self) -> Option<u32>;
}

/// Shared reopen guard for implementations: `Ok(true)` when the port
/// actually needs to be reconfigured.
pub fn speed_changed(current: Option<u32>, requested: u32) -> LinkResult<bool> {
    if requested == 0 {
        return Err(LinkError::UnsupportedSpeed { baud: requested });
    }
    Ok(current != Some(requested))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_speed_needs_no_reopen() {
        assert_eq!(speed_changed(Some(9_600), 9_600).unwrap(), false);
        assert_eq!(speed_changed(Some(9_600), 115_200).unwrap(), true);
        assert_eq!(speed_changed(None, 9_600).unwrap(), true);
    }

    #[test]
    fn zero_speed_is_rejected() {
        assert!(matches!(
            speed_changed(Some(9_600), 0),
            Err(LinkError::UnsupportedSpeed { baud: 0 })
        ));
    }
}
