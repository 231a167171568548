use crate::connection::Connection;
use crate::protocol::{
    self, BootInfo, Opcode, BOOT_INFO_LEN, LOAD_BOOT_HEADER_LEN, LOAD_SEGMENT_DATA_MAX,
    LOAD_SEGMENT_HEADER_LEN, LOAD_SEGMENT_HEADER_RESP_LEN,
};
use crate::{transport::Transport, Config, Error};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::{
    io::{self, Cursor, Read},
    thread::sleep,
    time::{Duration, Instant},
};

/// The handshake burst keeps the line busy for this long.
const HANDSHAKE_WINDOW: Duration = Duration::from_millis(5);
const HANDSHAKE_SETTLE: Duration = Duration::from_millis(20);

fn get_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .progress_chars("#>-"),
    );
    bar
}

/// Reads until `len` bytes are collected or the source ends.
fn read_up_to(reader: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// What the diagnostic queries after connecting managed to read.
#[derive(Debug, Default)]
pub struct DeviceInfo {
    pub boot_info: Option<BootInfo>,
    pub jedec_id: Option<Vec<u8>>,
}

pub struct Flasher {
    connection: Connection,
}

impl Flasher {
    /// Resets the chip into its boot ROM and handshakes with it.
    ///
    /// The transport is dropped, and with it closed, if the handshake fails.
    pub fn connect(port: impl Transport + 'static, config: &Config) -> Result<Self, Error> {
        let flasher = Flasher {
            connection: Connection::new(port, config)?,
        };
        flasher.reset()?;
        flasher.handshake()?;
        log::info!("Handshake succeed");

        Ok(flasher)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn into_inner(self) -> Connection {
        self.connection
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.connection.reset_to_flash()
    }

    pub fn handshake(&self) -> Result<(), Error> {
        let len = self.connection.calc_duration_length(HANDSHAKE_WINDOW);
        log::debug!("5ms send count {}", len);
        let data = vec![Opcode::Handshake as u8; len];

        self.connection
            .try_command(&data, Some(0))
            .map_err(|e| Error::HandshakeFailed(Box::new(e)))?;
        sleep(HANDSHAKE_SETTLE);

        Ok(())
    }

    pub fn boot_rom(&self) -> BootRom {
        BootRom(&self.connection)
    }

    /// Reads boot info and the flash id. Failures are logged, not returned.
    pub fn query(&self) -> DeviceInfo {
        let boot_info = self
            .boot_rom()
            .get_boot_info()
            .map_err(|e| log::error!("Failed to read boot info: {}", e))
            .ok();
        let jedec_id = self
            .boot_rom()
            .read_jedec_id()
            .map_err(|e| log::error!("Failed to read flash id: {}", e))
            .ok();

        DeviceInfo {
            boot_info,
            jedec_id,
        }
    }

    /// Loads a single-segment RAM image, checks it and jumps into it.
    ///
    /// `image` is the boot header, one segment header and the segment data.
    pub fn load_image(&self, image: &[u8]) -> Result<(), Error> {
        let mut reader = Cursor::new(image);
        let boot_rom = self.boot_rom();
        boot_rom.load_boot_header(&mut reader)?;
        boot_rom.load_segment_header(&mut reader)?;

        let len = image
            .len()
            .saturating_sub(LOAD_BOOT_HEADER_LEN + LOAD_SEGMENT_HEADER_LEN);
        let start = Instant::now();
        log::info!("Sending image...");
        let pb = get_bar(len as u64);
        loop {
            let size = boot_rom.load_segment_data(&mut reader)?;
            pb.inc(size as u64);
            if size == 0 {
                break;
            }
        }
        pb.finish_and_clear();
        let elapsed = start.elapsed();
        log::info!(
            "Finished {:?} {}/s",
            elapsed,
            HumanBytes((len as f64 / elapsed.as_secs_f64()) as u64)
        );

        boot_rom.check_image()?;
        boot_rom.run_image()?;
        log::info!("Image is running");

        Ok(())
    }
}

pub struct BootRom<'a>(&'a Connection);

impl<'a> BootRom<'a> {
    fn simple(&self, opcode: Opcode) -> Result<(), Error> {
        self.0
            .try_command(&protocol::encode(opcode, &[])?, Some(0))?;
        Ok(())
    }

    pub fn run_image(&self) -> Result<(), Error> {
        self.simple(Opcode::RunImage)
    }

    pub fn check_image(&self) -> Result<(), Error> {
        self.simple(Opcode::CheckImage)
    }

    pub fn get_boot_info(&self) -> Result<BootInfo, Error> {
        let data = self.0.try_command(
            &protocol::encode(Opcode::GetBootInfo, &[])?,
            Some(BOOT_INFO_LEN),
        )?;
        log::info!("BootInfo: {}", hex::encode(&data));

        let mut boot_info = BootInfo::from_payload(&data)?;
        if let Some(chip_id) = protocol::chip_id(&data) {
            log::info!("ChipID: {}", hex::encode(chip_id));
            boot_info.chip_id = chip_id.to_vec();
        }

        Ok(boot_info)
    }

    pub fn read_jedec_id(&self) -> Result<Vec<u8>, Error> {
        let data = self
            .0
            .try_command(&protocol::encode(Opcode::ReadJedecId, &[])?, None)?;
        log::info!("ReadJedecId: {}", hex::encode(&data));
        Ok(data)
    }

    pub fn load_boot_header(&self, reader: &mut impl Read) -> Result<(), Error> {
        let boot_header = read_up_to(reader, LOAD_BOOT_HEADER_LEN)?;
        if boot_header.len() != LOAD_BOOT_HEADER_LEN {
            return Err(Error::InvalidBootHeader(boot_header.len()));
        }

        self.0.try_command(
            &protocol::encode(Opcode::LoadBootHeader, &boot_header)?,
            Some(0),
        )?;
        Ok(())
    }

    pub fn load_segment_header(&self, reader: &mut impl Read) -> Result<(), Error> {
        let segment_header = read_up_to(reader, LOAD_SEGMENT_HEADER_LEN)?;
        if segment_header.len() != LOAD_SEGMENT_HEADER_LEN {
            return Err(Error::InvalidSegmentHeader(segment_header.len()));
        }

        let resp = self.0.try_command(
            &protocol::encode(Opcode::LoadSegmentHeader, &segment_header)?,
            Some(LOAD_SEGMENT_HEADER_RESP_LEN),
        )?;

        if resp.get(2..) != Some(&segment_header[..]) {
            log::warn!(
                "Segment header not match req:{:x?} != resp:{:x?}",
                segment_header,
                resp
            )
        }

        Ok(())
    }

    /// Sends the next chunk of segment data. Returns 0 once the source is
    /// exhausted, without sending anything.
    pub fn load_segment_data(&self, reader: &mut impl Read) -> Result<usize, Error> {
        let segment_data = read_up_to(reader, LOAD_SEGMENT_DATA_MAX)?;
        if segment_data.is_empty() {
            return Ok(0);
        }

        self.0.try_command(
            &protocol::encode(Opcode::LoadSegmentData, &segment_data)?,
            Some(0),
        )?;

        Ok(segment_data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ImageError, RomError};
    use crate::transport::mock::{MockPort, PortLog};
    use std::sync::{Arc, Mutex};

    fn connected(port: MockPort) -> (Flasher, Arc<Mutex<PortLog>>) {
        // first response answers the handshake
        let log = port.log.clone();
        let flasher = Flasher::connect(port, &Config::default()).unwrap();
        (flasher, log)
    }

    fn opcodes(log: &Arc<Mutex<PortLog>>) -> Vec<u8> {
        log.lock().unwrap().writes.iter().map(|w| w[0]).collect()
    }

    #[test]
    fn handshake_sends_one_burst() {
        let (_flasher, log) = connected(MockPort::new().respond_ok(&[]));

        let log = log.lock().unwrap();
        assert_eq!(log.writes, vec![vec![0x55u8; 57]]);
    }

    #[test]
    fn handshake_failure_is_reported() {
        let port = MockPort::new();
        let log = port.log.clone();

        match Flasher::connect(port, &Config::default()) {
            Err(Error::HandshakeFailed(source)) => {
                assert!(matches!(*source, Error::IO(_)))
            }
            Err(e) => panic!("unexpected {:?}", e),
            Ok(_) => panic!("handshake should fail"),
        }
        assert_eq!(log.lock().unwrap().writes.len(), 5);
    }

    #[test]
    fn connect_survives_rejected_line_control() {
        let (_flasher, log) = connected(MockPort::new().reject_rts().respond_ok(&[]));

        assert_eq!(log.lock().unwrap().writes, vec![vec![0x55u8; 57]]);
    }

    #[test]
    fn boot_info_is_decoded() {
        let mut payload = vec![0x18, 0x00, 0x01, 0x00, 0x00, 0x00];
        payload.extend_from_slice(&[0u8; 16]);
        payload.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let (flasher, log) = connected(MockPort::new().respond_ok(&[]).respond_ok(&payload));

        let info = flasher.boot_rom().get_boot_info().unwrap();
        assert_eq!(info.bootrom_version, 1);
        assert_eq!(info.chip_id, payload[18..].to_vec());
        assert_eq!(log.lock().unwrap().writes[1], vec![0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn jedec_id_takes_any_length() {
        let (flasher, _log) =
            connected(MockPort::new().respond_ok(&[]).respond_ok(&[0xef, 0x40, 0x15]));

        assert_eq!(flasher.boot_rom().read_jedec_id().unwrap(), vec![0xef, 0x40, 0x15]);
    }

    #[test]
    fn query_survives_failures() {
        let mut port = MockPort::new().respond_ok(&[]);
        for _ in 0..5 {
            port = port.respond_fail(0x01, 0x01);
        }
        let (flasher, _log) = connected(port.respond_ok(&[0xc8, 0x40, 0x16]));

        let info = flasher.query();
        assert!(info.boot_info.is_none());
        assert_eq!(info.jedec_id, Some(vec![0xc8, 0x40, 0x16]));
    }

    #[test]
    fn short_segment_header_sends_nothing() {
        let (flasher, log) = connected(MockPort::new().respond_ok(&[]));

        let mut reader = Cursor::new(vec![0u8; 10]);
        match flasher.boot_rom().load_segment_header(&mut reader) {
            Err(Error::InvalidSegmentHeader(10)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.lock().unwrap().writes.len(), 1);
    }

    #[test]
    fn short_boot_header_sends_nothing() {
        let (flasher, log) = connected(MockPort::new().respond_ok(&[]));

        let mut reader = Cursor::new(vec![0u8; 175]);
        match flasher.boot_rom().load_boot_header(&mut reader) {
            Err(Error::InvalidBootHeader(175)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.lock().unwrap().writes.len(), 1);
    }

    #[test]
    fn segment_data_is_chunked() {
        let port = MockPort::new()
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&[]);
        let (flasher, log) = connected(port);

        let mut reader = Cursor::new(vec![0xa5u8; 5000]);
        let boot_rom = flasher.boot_rom();
        assert_eq!(boot_rom.load_segment_data(&mut reader).unwrap(), 2048);
        assert_eq!(boot_rom.load_segment_data(&mut reader).unwrap(), 2048);
        assert_eq!(boot_rom.load_segment_data(&mut reader).unwrap(), 904);
        assert_eq!(boot_rom.load_segment_data(&mut reader).unwrap(), 0);

        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 4);
        assert_eq!(&log.writes[1][..4], &[0x18, 0x00, 0x00, 0x08]);
        assert_eq!(&log.writes[3][..4], &[0x18, 0x00, 0x88, 0x03]);
        assert_eq!(log.writes[3].len(), 4 + 904);
    }

    #[test]
    fn load_image_runs_the_whole_sequence() {
        let mut image = vec![0x42u8; LOAD_BOOT_HEADER_LEN];
        let segment_header: Vec<u8> = (0..16).collect();
        image.extend_from_slice(&segment_header);
        image.extend(vec![0x5au8; 3000]);

        let mut echo = vec![0x10, 0x00];
        echo.extend_from_slice(&segment_header);
        let port = MockPort::new()
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&echo)
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&[]);
        let (flasher, log) = connected(port);

        flasher.load_image(&image).unwrap();
        assert_eq!(
            opcodes(&log),
            vec![0x55, 0x11, 0x17, 0x18, 0x18, 0x19, 0x1a]
        );
        let log = log.lock().unwrap();
        assert_eq!(&log.writes[1][..4], &[0x11, 0x00, 0xb0, 0x00]);
        assert_eq!(&log.writes[2][4..], &segment_header[..]);
    }

    #[test]
    fn failed_check_is_terminal() {
        let mut image = vec![0u8; LOAD_BOOT_HEADER_LEN + LOAD_SEGMENT_HEADER_LEN];
        image.extend(vec![1u8; 10]);
        let mut port = MockPort::new()
            .respond_ok(&[])
            .respond_ok(&[])
            .respond_ok(&[0x10, 0x00])
            .respond_ok(&[]);
        for _ in 0..5 {
            port = port.respond_fail(0x02, 0x15);
        }
        let (flasher, log) = connected(port);

        match flasher.load_image(&image) {
            Err(Error::RomError(e)) => {
                assert_eq!(e, RomError::Image(ImageError::SectionDataCrc))
            }
            other => panic!("unexpected {:?}", other),
        }
        let opcodes = opcodes(&log);
        assert_eq!(opcodes.iter().filter(|&&op| op == 0x19).count(), 5);
        assert!(!opcodes.contains(&0x1a));
    }
}
