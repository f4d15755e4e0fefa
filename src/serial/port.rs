use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use tracing::{debug, info};

/// Byte-level serial channel as seen by the control loop.
pub trait SerialPort {
    /// Returns the next received byte, or `None` when nothing is pending.
    /// Must not block. `UnexpectedEof` signals that the link is gone.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Queues bytes for transmission
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

impl<P: SerialPort + ?Sized> SerialPort for &mut P {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        (**self).read_byte()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_bytes(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// In-memory port: scripted input, captured output.
#[derive(Debug, Default)]
pub struct MemoryPort {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    closed: bool,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port pre-loaded with `input`
    pub fn with_input(input: &[u8]) -> Self {
        let mut port = Self::new();
        port.feed(input);
        port
    }

    /// Makes more bytes available to `read_byte`
    pub fn feed(&mut self, input: &[u8]) {
        self.rx.extend(input.iter().copied());
    }

    /// Once the pending input drains, reads report end of stream
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Everything written so far
    pub fn output(&self) -> &[u8] {
        &self.tx
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.tx).into_owned()
    }

    /// Returns and clears the captured output
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl SerialPort for MemoryPort {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        match self.rx.pop_front() {
            Some(byte) => Ok(Some(byte)),
            None if self.closed => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "memory port closed")),
            None => Ok(None),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Port backed by a blocking reader drained on a helper thread.
///
/// The helper thread only stands in for the UART receive FIFO; all
/// processing stays on the caller's thread.
pub struct ThreadedPort<W: Write> {
    rx: Receiver<u8>,
    writer: W,
}

impl<W: Write> ThreadedPort<W> {
    pub fn spawn<R>(reader: R, writer: W, name: &str) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (sender, rx) = mpsc::channel();
        let thread_name = format!("{}-rx", name);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for byte in reader.bytes() {
                    match byte {
                        Ok(b) => {
                            if sender.send(b).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Serial receive stopped: {}", e);
                            break;
                        }
                    }
                }
            })?;
        Ok(Self { rx, writer })
    }
}

impl<W: Write> SerialPort for ThreadedPort<W> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        match self.rx.try_recv() {
            Ok(byte) => Ok(Some(byte)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial link closed"))
            }
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Serial channel over the process's stdin/stdout
pub fn open_stdio() -> io::Result<ThreadedPort<io::Stdout>> {
    info!("Opening serial channel on stdio");
    ThreadedPort::spawn(io::stdin(), io::stdout(), "stdio")
}

/// Serial channel over a character device. Line settings (baud rate,
/// framing) must already be applied to the device.
pub fn open_device(path: &Path, baud_rate: u32) -> io::Result<ThreadedPort<std::fs::File>> {
    let device = OpenOptions::new().read(true).write(true).open(path)?;
    let reader = device.try_clone()?;
    info!("Opened serial device {} (expecting {} baud)", path.display(), baud_rate);
    ThreadedPort::spawn(reader, device, "device")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    #[test]
    fn test_memory_port_reads_in_order() {
        let mut port = MemoryPort::with_input(b"ab");
        assert_eq!(port.read_byte().unwrap(), Some(b'a'));
        assert_eq!(port.read_byte().unwrap(), Some(b'b'));
        assert_eq!(port.read_byte().unwrap(), None);

        port.close();
        let err = port.read_byte().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_memory_port_captures_output() {
        let mut port = MemoryPort::new();
        port.write_bytes(b"hello").unwrap();
        port.write_bytes(b"\r\n").unwrap();
        assert_eq!(port.output(), b"hello\r\n");
        assert_eq!(port.take_output(), b"hello\r\n".to_vec());
        assert!(port.output().is_empty());
    }

    #[test]
    fn test_threaded_port_drains_reader_then_reports_eof() {
        let mut port = ThreadedPort::spawn(Cursor::new(b"xyz".to_vec()), Vec::new(), "test").unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            match port.read_byte() {
                Ok(Some(b)) => received.push(b),
                Ok(None) => {
                    assert!(Instant::now() < deadline, "reader thread stalled");
                    thread::yield_now();
                }
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
            }
        }
        assert_eq!(received, b"xyz");

        port.write_bytes(b"ok").unwrap();
        assert_eq!(port.writer, b"ok");
    }
}
