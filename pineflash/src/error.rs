use std::fmt;
use thiserror::Error;

use crate::protocol::{LOAD_BOOT_HEADER_LEN, LOAD_SEGMENT_HEADER_LEN, STATUS_FAIL};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while using serial port: {0}")]
    Serial(#[from] serial::core::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Failed to handshake with the boot ROM: {0}")]
    HandshakeFailed(#[source] Box<Error>),
    #[error("Invalid response header")]
    InvalidResponse,
    #[error("Frame payload of {0} bytes does not fit the length field")]
    FrameTooLarge(usize),
    #[error("Boot header must be {} bytes, got {0}", LOAD_BOOT_HEADER_LEN)]
    InvalidBootHeader(usize),
    #[error("Segment header must be {} bytes, got {0}", LOAD_SEGMENT_HEADER_LEN)]
    InvalidSegmentHeader(usize),
    #[error("ROM error {0}")]
    RomError(RomError),
    #[error("Parse error")]
    ParseError(#[from] deku::error::DekuError),
    #[error("Parse toml error")]
    TomlError(#[from] toml::de::Error),
}

impl Error {
    /// Decodes the error carried by a response that did not start with `OK`.
    ///
    /// The failure layout is `FL`, then the code byte, then the category byte.
    /// Anything else, including a truncated `FL` response, is
    /// [`Error::InvalidResponse`].
    pub fn from_response(resp: &[u8]) -> Error {
        match resp.strip_prefix(&STATUS_FAIL) {
            Some([code, category, ..]) => RomError::decode(*category, *code)
                .map(Error::RomError)
                .unwrap_or(Error::InvalidResponse),
            _ => {
                log::trace!("from_response err: {:x?}", resp);
                Error::InvalidResponse
            }
        }
    }
}

/// Which sub-taxonomy a device error code belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCategory {
    Flash = 0x00,
    Cmd = 0x01,
    Image = 0x02,
    Interface = 0x03,
    Misc = 0xff,
}

impl ErrorCategory {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => ErrorCategory::Flash,
            0x01 => ErrorCategory::Cmd,
            0x02 => ErrorCategory::Image,
            0x03 => ErrorCategory::Interface,
            0xff => ErrorCategory::Misc,
            _ => return None,
        })
    }
}

macro_rules! rom_error_codes(
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal => $label:literal,)* }) => (
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum $name {
            $($variant,)*
            Unknown(u8),
        }

        impl From<u8> for $name {
            fn from(raw: u8) -> Self {
                match raw {
                    $($value => $name::$variant,)*
                    _ => $name::Unknown(raw),
                }
            }
        }

        impl $name {
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $value,)*
                    $name::Unknown(raw) => raw,
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)*
                    $name::Unknown(_) => "UNKNOWN",
                }
            }
        }
    );
);

rom_error_codes!(
    /// Flash controller faults.
    FlashError {
        Init = 0x01 => "ERR_FLASH_INIT_ERROR",
        ErasePara = 0x02 => "ERR_FLASH_ERASE_PARA_ERROR",
        Erase = 0x03 => "ERR_FLASH_ERASE_ERROR",
        WritePara = 0x04 => "ERR_FLASH_WRITE_PARA_ERROR",
        WriteAddr = 0x05 => "ERR_FLASH_WRITE_ADDR_ERROR",
        Write = 0x06 => "ERR_FLASH_WRITE_ERROR",
        BootPara = 0x07 => "ERR_FLASH_BOOT_PARA_ERROR",
        SetPara = 0x08 => "ERR_FLASH_SET_PARA_ERROR",
        ReadStatusReg = 0x09 => "ERR_FLASH_READ_STATUS_REG_ERROR",
        WriteStatusReg = 0x0a => "ERR_FLASH_WRITE_STATUS_REG_ERROR",
    }
);

rom_error_codes!(
    /// Command framing faults.
    CmdError {
        Id = 0x01 => "ERR_CMD_ID_ERROR",
        Len = 0x02 => "ERR_CMD_LEN_ERROR",
        Crc = 0x03 => "ERR_CMD_CRC_ERROR",
        Seq = 0x04 => "ERR_CMD_SEQ_ERROR",
    }
);

rom_error_codes!(
    /// Boot image validation faults.
    ImageError {
        BootHeaderLen = 0x01 => "ERR_IMG_BOOTHEADER_LEN_ERROR",
        BootHeaderNotLoad = 0x02 => "ERR_IMG_BOOTHEADER_NOT_LOAD_ERROR",
        BootHeaderMagic = 0x03 => "ERR_IMG_BOOTHEADER_MAGIC_ERROR",
        BootHeaderCrc = 0x04 => "ERR_IMG_BOOTHEADER_CRC_ERROR",
        BootHeaderEncryptNotFit = 0x05 => "ERR_IMG_BOOTHEADER_ENCRYPT_NOTFIT",
        BootHeaderSignNotFit = 0x06 => "ERR_IMG_BOOTHEADER_SIGN_NOTFIT",
        SegmentCnt = 0x07 => "ERR_IMG_SEGMENT_CNT_ERROR",
        AesIvLen = 0x08 => "ERR_IMG_AES_IV_LEN_ERROR",
        AesIvCrc = 0x09 => "ERR_IMG_AES_IV_CRC_ERROR",
        PkLen = 0x0a => "ERR_IMG_PK_LEN_ERROR",
        PkCrc = 0x0b => "ERR_IMG_PK_CRC_ERROR",
        PkHash = 0x0c => "ERR_IMG_PK_HASH_ERROR",
        SignatureLen = 0x0d => "ERR_IMG_SIGNATURE_LEN_ERROR",
        SignatureCrc = 0x0e => "ERR_IMG_SIGNATURE_CRC_ERROR",
        SectionHeaderLen = 0x0f => "ERR_IMG_SECTIONHEADER_LEN_ERROR",
        SectionHeaderCrc = 0x10 => "ERR_IMG_SECTIONHEADER_CRC_ERROR",
        SectionHeaderDst = 0x11 => "ERR_IMG_SECTIONHEADER_DST_ERROR",
        SectionDataLen = 0x12 => "ERR_IMG_SECTIONDATA_LEN_ERROR",
        SectionDataDec = 0x13 => "ERR_IMG_SECTIONDATA_DEC_ERROR",
        SectionDataTlen = 0x14 => "ERR_IMG_SECTIONDATA_TLEN_ERROR",
        SectionDataCrc = 0x15 => "ERR_IMG_SECTIONDATA_CRC_ERROR",
        HalfBaked = 0x16 => "ERR_IMG_HALFBAKED_ERROR",
        Hash = 0x17 => "ERR_IMG_HASH_ERROR",
        SignParse = 0x18 => "ERR_IMG_SIGN_PARSE_ERROR",
        Sign = 0x19 => "ERR_IMG_SIGN_ERROR",
        Dec = 0x1a => "ERR_IMG_DEC_ERROR",
        AllInvalid = 0x1b => "ERR_IMG_ALL_INVALID_ERROR",
    }
);

rom_error_codes!(
    /// Host interface faults.
    InterfaceError {
        RateLen = 0x01 => "ERR_IF_RATE_LEN_ERROR",
        RatePara = 0x02 => "ERR_IF_RATE_PARA_ERROR",
        Password = 0x03 => "ERR_IF_PASSWORDERROR",
        PasswordClose = 0x04 => "ERR_IF_PASSWORDCLOSE",
    }
);

rom_error_codes!(
    MiscError {
        Pll = 0xfc => "ERR_PLL_ERROR",
        Invasion = 0xfd => "ERR_INVASION_ERROR",
        Polling = 0xfe => "ERR_POLLING",
        Fail = 0xff => "ERR_FAIL",
    }
);

/// A fault reported by the boot ROM in an `FL` response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RomError {
    Flash(FlashError),
    Cmd(CmdError),
    Image(ImageError),
    Interface(InterfaceError),
    Misc(MiscError),
}

impl RomError {
    /// Returns `None` when `category` is not one of the known categories.
    /// Unknown codes inside a known category decode to an `Unknown` arm.
    pub fn decode(category: u8, code: u8) -> Option<Self> {
        Some(match ErrorCategory::from_u8(category)? {
            ErrorCategory::Flash => RomError::Flash(code.into()),
            ErrorCategory::Cmd => RomError::Cmd(code.into()),
            ErrorCategory::Image => RomError::Image(code.into()),
            ErrorCategory::Interface => RomError::Interface(code.into()),
            ErrorCategory::Misc => RomError::Misc(code.into()),
        })
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RomError::Flash(_) => ErrorCategory::Flash,
            RomError::Cmd(_) => ErrorCategory::Cmd,
            RomError::Image(_) => ErrorCategory::Image,
            RomError::Interface(_) => ErrorCategory::Interface,
            RomError::Misc(_) => ErrorCategory::Misc,
        }
    }

    pub fn code(&self) -> u8 {
        match *self {
            RomError::Flash(e) => e.code(),
            RomError::Cmd(e) => e.code(),
            RomError::Image(e) => e.code(),
            RomError::Interface(e) => e.code(),
            RomError::Misc(e) => e.code(),
        }
    }

    pub fn label(&self) -> &'static str {
        match *self {
            RomError::Flash(e) => e.label(),
            RomError::Cmd(e) => e.label(),
            RomError::Image(e) => e.label(),
            RomError::Interface(e) => e.label(),
            RomError::Misc(e) => e.label(),
        }
    }
}

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (category {:#04x}, code {:#04x})",
            self.label(),
            self.category() as u8,
            self.code()
        )
    }
}
