//! Console Device
//!
//! Backs the `cputs` and `cgetc` system calls. The kernel only needs a
//! byte sink and a non-blocking byte source.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

/// A character device.
pub trait Console {
    /// Emit bytes verbatim.
    fn write_bytes(&mut self, bytes: &[u8]);

    /// Next input byte, if one is waiting.
    fn getc(&mut self) -> Option<u8>;
}

impl fmt::Write for dyn Console + Send {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Discards output, never has input.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsole;

impl Console for NullConsole {
    fn write_bytes(&mut self, _bytes: &[u8]) {}

    fn getc(&mut self) -> Option<u8> {
        None
    }
}

/// In-memory console whose output can be inspected from outside the kernel.
#[derive(Debug, Default)]
pub struct BufferConsole {
    output: Arc<Mutex<Vec<u8>>>,
    input: VecDeque<u8>,
}

impl BufferConsole {
    /// Console with `input` queued for `getc`.
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            output: Arc::default(),
            input: input.iter().copied().collect(),
        }
    }

    /// Shared handle to everything written so far.
    pub fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.output)
    }
}

impl Console for BufferConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    fn getc(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::fmt::Write;

    #[test]
    fn buffer_console_records_output() {
        let console = BufferConsole::with_input(b"hi");
        let out = console.output();
        let mut dev: Box<dyn Console + Send> = Box::new(console);

        write!(dev, "env {:08x}", 0x1000).unwrap();
        assert_eq!(out.lock().as_slice(), b"env 00001000");
        assert_eq!(dev.getc(), Some(b'h'));
        assert_eq!(dev.getc(), Some(b'i'));
        assert_eq!(dev.getc(), None);
    }
}
