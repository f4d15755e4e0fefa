mod line_buffer;
mod port;

pub use line_buffer::{LineBuffer, LineEvent, INPUT_BUFFER_SIZE, LINE_TERMINATOR};
pub use port::{open_device, open_stdio, MemoryPort, SerialPort, ThreadedPort};
