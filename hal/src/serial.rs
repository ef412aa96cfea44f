// Licensed under the Apache-2.0 license

/// Polled byte-oriented serial line.
pub trait SerialPort {
    /// Waits up to `timeout_secs` for a byte.
    fn read_byte(&mut self, timeout_secs: u32) -> Option<u8>;

    fn write_byte(&mut self, byte: u8);

    fn write_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }
}
