use crate::console::Console;

pub struct SerialWriter {
    port: uart_16550::SerialPort,
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
/// Initializes COM1 and routes console output to it.
pub fn init(console: &Console) {
    // SAFETY: 0x3F8 is the standard COM1 base and nothing else drives it.
    let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
    port.init();
    console.attach_serial(SerialWriter { port });
}
