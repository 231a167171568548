use crate::Error;
use serial::{BaudRate, SerialPort, SerialPortSettings};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
/// Upper bound on an input drain, even if the chip keeps talking.
const DRAIN_LIMIT: Duration = Duration::from_millis(100);

/// Byte stream to the boot ROM plus the line control needed to reset into it.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
    fn set_rts(&mut self, level: bool) -> Result<(), Error>;
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;
    fn reconfigure(&mut self, speed: BaudRate) -> Result<(), Error>;
    /// Discards bytes received but not yet read.
    fn reset_input_buffer(&mut self) -> Result<(), Error>;
    /// Makes sure nothing queued earlier is still on its way out.
    fn reset_output_buffer(&mut self) -> Result<(), Error>;
}

/// Discards whatever `reader` yields until it goes quiet or `limit` passes.
fn drain(reader: &mut impl Read, limit: Duration) -> io::Result<usize> {
    let start = Instant::now();
    let mut buf = [0u8; 256];
    let mut drained = 0;
    while start.elapsed() < limit {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(drained)
}

// The serial crate keeps one timeout for both directions. The read timeout is
// the resting value; the write timeout is swapped in around each write.
pub struct SerialTransport<P = serial::SystemPort> {
    port: P,
    read_timeout: Duration,
    write_timeout: Option<Duration>,
}

impl SerialTransport {
    /// Opens `port` as 8N1 without flow control.
    pub fn open(port: &str, speed: BaudRate) -> Result<Self, Error> {
        let mut port = serial::open(port)?;
        port.reconfigure(&|setup: &mut dyn SerialPortSettings| {
            setup.set_baud_rate(speed)?;
            setup.set_char_size(serial::Bits8);
            setup.set_parity(serial::ParityNone);
            setup.set_stop_bits(serial::Stop1);
            setup.set_flow_control(serial::FlowNone);
            Ok(())
        })?;
        Ok(SerialTransport::new(port))
    }
}

impl<P: SerialPort> SerialTransport<P> {
    /// Wraps an already configured port.
    pub fn new(port: P) -> Self {
        let read_timeout = port.timeout();
        SerialTransport {
            port,
            read_timeout,
            write_timeout: None,
        }
    }

    fn with_timeout<T, F: FnOnce(&mut P) -> io::Result<T>>(
        &mut self,
        timeout: Duration,
        f: F,
    ) -> io::Result<T> {
        self.port.set_timeout(timeout)?;
        let result = f(&mut self.port);
        self.port.set_timeout(self.read_timeout)?;
        result
    }
}

impl<P: SerialPort + Send> Transport for SerialTransport<P> {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.read_timeout = timeout;
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.write_timeout = Some(timeout);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port.set_rts(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port.set_dtr(level)?;
        Ok(())
    }

    fn reconfigure(&mut self, speed: BaudRate) -> Result<(), Error> {
        self.port
            .reconfigure(&|setup: &mut dyn SerialPortSettings| setup.set_baud_rate(speed))?;
        Ok(())
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        let drained = self.with_timeout(DRAIN_TIMEOUT, |port| drain(port, DRAIN_LIMIT))?;
        log::trace!("drained {} stale bytes", drained);
        Ok(())
    }

    // serial has no discard, so this waits for pending output to go out
    fn reset_output_buffer(&mut self) -> Result<(), Error> {
        Ok(self.port.flush()?)
    }
}

impl<P: SerialPort> Read for SerialTransport<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl<P: SerialPort> Write for SerialTransport<P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_timeout {
            Some(timeout) => self.with_timeout(timeout, |port| port.write(buf)),
            None => self.port.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial::core::SerialDevice;
    use serial::PortSettings;

    /// Serial device that remembers which timeout each operation ran under.
    struct RecordingDevice {
        timeout: Duration,
        write_timeouts: Vec<Duration>,
        chatty: bool,
    }

    impl RecordingDevice {
        fn new(chatty: bool) -> Self {
            RecordingDevice {
                timeout: Duration::from_millis(1000),
                write_timeouts: Vec::new(),
                chatty,
            }
        }
    }

    impl Read for RecordingDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chatty {
                buf.iter_mut().for_each(|b| *b = b'.');
                Ok(buf.len())
            } else {
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }

    impl Write for RecordingDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_timeouts.push(self.timeout);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialDevice for RecordingDevice {
        type Settings = PortSettings;

        fn read_settings(&self) -> serial::Result<PortSettings> {
            Ok(PortSettings {
                baud_rate: serial::Baud115200,
                char_size: serial::Bits8,
                parity: serial::ParityNone,
                stop_bits: serial::Stop1,
                flow_control: serial::FlowNone,
            })
        }

        fn write_settings(&mut self, _settings: &PortSettings) -> serial::Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> serial::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> serial::Result<()> {
            Ok(())
        }

        fn set_dtr(&mut self, _level: bool) -> serial::Result<()> {
            Ok(())
        }

        fn read_cts(&mut self) -> serial::Result<bool> {
            Ok(false)
        }

        fn read_dsr(&mut self) -> serial::Result<bool> {
            Ok(false)
        }

        fn read_ri(&mut self) -> serial::Result<bool> {
            Ok(false)
        }

        fn read_cd(&mut self) -> serial::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn write_timeout_applies_to_writes_only() {
        let mut transport = SerialTransport::new(RecordingDevice::new(false));
        transport.set_write_timeout(Duration::from_millis(500)).unwrap();
        transport.set_read_timeout(Duration::from_millis(200)).unwrap();

        transport.write_all(b"abc").unwrap();
        assert_eq!(transport.port.write_timeouts, vec![Duration::from_millis(500)]);
        assert_eq!(transport.port.timeout, Duration::from_millis(200));
    }

    #[test]
    fn writes_use_read_timeout_without_write_timeout() {
        let mut transport = SerialTransport::new(RecordingDevice::new(false));
        transport.set_read_timeout(Duration::from_millis(200)).unwrap();

        transport.write_all(b"abc").unwrap();
        assert_eq!(transport.port.write_timeouts, vec![Duration::from_millis(200)]);
    }

    #[test]
    fn drain_of_endless_input_is_bounded() {
        let mut transport = SerialTransport::new(RecordingDevice::new(true));
        transport.set_read_timeout(Duration::from_millis(200)).unwrap();

        let start = Instant::now();
        transport.reset_input_buffer().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.port.timeout, Duration::from_millis(200));
    }

    #[test]
    fn drain_stops_when_line_is_quiet() {
        let mut quiet = RecordingDevice::new(false);
        assert_eq!(drain(&mut quiet, DRAIN_LIMIT).unwrap(), 0);

        let mut endless = io::repeat(0x55);
        assert!(drain(&mut endless, Duration::from_millis(5)).unwrap() > 0);
    }
}
