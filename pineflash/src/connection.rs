use crate::protocol::{decode_status, Status};
use crate::{transport::Transport, Config, Error};
use serial::BaudRate;
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::Duration;

const RESET_STEP: Duration = Duration::from_millis(50);

fn closed() -> Error {
    io::Error::new(io::ErrorKind::NotConnected, "session closed").into()
}

fn reset_step(step: &str, result: Result<(), Error>) {
    if let Err(e) = result {
        log::warn!("reset: {} failed: {}", step, e);
    }
}

/// Everything that must only be touched by one exchange at a time.
struct Link {
    port: Option<Box<dyn Transport>>,
    rbuf: Vec<u8>,
}

impl Link {
    fn port(&mut self) -> Result<&mut (dyn Transport + 'static), Error> {
        self.port.as_deref_mut().ok_or_else(closed)
    }

    // A retry re-sends the whole buffer.
    fn write(&mut self, retries: usize, buf: &[u8]) -> Result<(), Error> {
        let port = self.port()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match port.write_all(buf).and_then(|_| port.flush()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    log::trace!("write attempt {}/{} failed: {}", attempt, retries, e)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Accumulates up to `len` bytes, spending one retry per read call.
    ///
    /// Stops early once the buffer is full. Running out of retries returns
    /// whatever arrived; an error is only returned if nothing did.
    fn read(&mut self, retries: usize, len: usize) -> Result<Vec<u8>, Error> {
        let Link { port, rbuf } = self;
        let port = port.as_deref_mut().ok_or_else(closed)?;
        let capacity = rbuf.len();
        let mut offset = 0;
        let mut tries = retries;
        loop {
            let result = port.read(&mut rbuf[offset..]);
            tries -= 1;
            match result {
                Ok(n) => {
                    offset += n;
                    if offset >= len || offset >= capacity || tries == 0 {
                        break;
                    }
                }
                Err(e) if tries > 0 => log::trace!("read failed, {} tries left: {}", tries, e),
                Err(e) if offset > 0 => {
                    log::trace!("read gave up after {} bytes: {}", offset, e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(rbuf[..offset].to_vec())
    }

    fn command(
        &mut self,
        retries: usize,
        req: &[u8],
        expect: Option<usize>,
    ) -> Result<Vec<u8>, Error> {
        self.write(retries, req)?;
        let resp = self.read(retries, expect.map_or(0, |len| len + 2))?;
        log::trace!("resp: {:x?}", resp);
        if let Status::Ok(payload) = decode_status(&resp) {
            return Ok(payload.to_vec());
        }

        // error detail may trail the status
        let mut resp = resp;
        match self.read(retries, 0) {
            Ok(rest) => resp.extend_from_slice(&rest),
            Err(e) => log::trace!("no trailing error detail: {}", e),
        }
        Err(Error::from_response(&resp))
    }
}

/// A session with the boot ROM.
///
/// Owns the transport for its whole life. Every exchange runs under one lock
/// so writes and reads of different callers never interleave on the line.
pub struct Connection {
    link: Mutex<Link>,
    baud_rate: BaudRate,
    rw_retry: usize,
    cmd_retry: usize,
}

impl Connection {
    pub fn new(port: impl Transport + 'static, config: &Config) -> Result<Self, Error> {
        let config = config.clone().normalized();
        let mut port: Box<dyn Transport> = Box::new(port);
        let baud_rate = BaudRate::from_speed(config.baud_rate);

        port.reconfigure(baud_rate)?;
        if let Some(timeout) = config.write_timeout() {
            port.set_write_timeout(timeout)?;
        }
        port.set_read_timeout(config.read_timeout())?;

        Ok(Connection {
            link: Mutex::new(Link {
                port: Some(port),
                rbuf: vec![0u8; config.read_buffer_size],
            }),
            baud_rate,
            rw_retry: config.rw_retry,
            cmd_retry: config.cmd_retry,
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the transport out of the session. Every later operation fails.
    pub fn close(&self) -> Option<Box<dyn Transport>> {
        self.link().port.take()
    }

    pub fn into_inner(self) -> Option<Box<dyn Transport>> {
        self.link
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .port
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.baud_rate
    }

    /// Pulses RTS/DTR so the chip restarts into its boot ROM, then restores
    /// the line speed and drops anything left in the buffers.
    ///
    /// Line control has no failure signal from the device, so a step the
    /// adapter rejects is logged and the sequence carries on. Only a closed
    /// session is an error.
    pub fn reset_to_flash(&self) -> Result<(), Error> {
        let mut link = self.link();
        let port = link.port()?;

        reset_step("rts high", port.set_rts(true));
        sleep(RESET_STEP);
        reset_step("dtr high", port.set_dtr(true));
        sleep(RESET_STEP);
        reset_step("dtr low", port.set_dtr(false));
        sleep(RESET_STEP);
        reset_step("rts low", port.set_rts(false));
        sleep(RESET_STEP);

        reset_step("reconfigure", port.reconfigure(self.baud_rate));
        reset_step("input buffer reset", port.reset_input_buffer());
        reset_step("output buffer reset", port.reset_output_buffer());

        Ok(())
    }

    /// Number of bytes the line carries in `duration`, counting 10 bits per byte.
    pub fn calc_duration_length(&self, duration: Duration) -> usize {
        (self.baud_rate.speed() as f64 / 10.0 / 1000.0 * duration.as_millis() as f64) as usize
    }

    pub fn write(&self, buf: &[u8]) -> Result<(), Error> {
        self.link().write(self.rw_retry, buf)
    }

    pub fn read(&self, len: usize) -> Result<Vec<u8>, Error> {
        self.link().read(self.rw_retry, len)
    }

    /// One write-read-validate exchange. `expect` is the payload length after
    /// the status, `None` takes whatever the first read returns.
    pub fn command(&self, req: &[u8], expect: Option<usize>) -> Result<Vec<u8>, Error> {
        self.link().command(self.rw_retry, req, expect)
    }

    /// Repeats [`Connection::command`] with the identical request until it
    /// succeeds or the command budget runs out, returning the last error.
    pub fn try_command(&self, req: &[u8], expect: Option<usize>) -> Result<Vec<u8>, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.command(req, expect) {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.cmd_retry => log::debug!(
                    "command {:x?} attempt {}/{} failed: {}",
                    req.first(),
                    attempt,
                    self.cmd_retry,
                    e
                ),
                Err(e) => {
                    log::debug!("command {:x?} gave up: {}", req.first(), e);
                    return Err(e);
                }
            }
        }
    }
}
