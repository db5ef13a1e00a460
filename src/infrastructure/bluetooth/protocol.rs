//! Pybricks BLE Protocol
//!
//! Command encoding for hubs running Pybricks firmware (profile 1.2 and
//! later). Everything here is plain bytes so it can be tested anywhere; the
//! GATT plumbing lives in the platform backends.

use anyhow::{bail, Result};

/// Pybricks service UUID
pub const SERVICE_UUID: &str = "c5f50001-8280-46da-89f4-6d8051e4aeef";

/// Command/event characteristic: commands are written, events are notified
pub const COMMAND_EVENT_CHAR_UUID: &str = "c5f50002-8280-46da-89f4-6d8051e4aeef";

/// Hub capabilities characteristic (read only)
pub const HUB_CAPABILITIES_CHAR_UUID: &str = "c5f50003-8280-46da-89f4-6d8051e4aeef";

/// Used when the hub does not report its capabilities
pub const DEFAULT_MAX_WRITE_SIZE: usize = 20;

/// Bytes of framing in front of every `WriteUserRam` chunk: opcode + u32 offset
const USER_RAM_HEADER_LEN: usize = 5;

/// Bytes of framing in front of every `WriteStdin` chunk
const STDIN_HEADER_LEN: usize = 1;

/// MicroPython `.mpy` ABI the firmware loads (Pybricks 3.3 and later)
pub const MPY_ABI_VERSION: u8 = 6;

/// Commands written to the command/event characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PybricksCommand {
    /// Stop the running user program
    StopUserProgram,
    /// Start the user program currently in RAM
    StartUserProgram,
    /// Set the size of the user program; 0 invalidates it while uploading
    WriteUserProgramMeta { size: u32 },
    /// Copy a chunk of the program into user RAM
    WriteUserRam { offset: u32, data: Vec<u8> },
    /// Bytes for the running program's stdin
    WriteStdin(Vec<u8>),
}

impl PybricksCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::StopUserProgram => 0x00,
            Self::StartUserProgram => 0x01,
            Self::WriteUserProgramMeta { .. } => 0x03,
            Self::WriteUserRam { .. } => 0x04,
            Self::WriteStdin(_) => 0x06,
        }
    }

    /// Raw bytes for one GATT write
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.opcode()];
        match self {
            Self::StopUserProgram | Self::StartUserProgram => {}
            Self::WriteUserProgramMeta { size } => bytes.extend_from_slice(&size.to_le_bytes()),
            Self::WriteUserRam { offset, data } => {
                bytes.extend_from_slice(&offset.to_le_bytes());
                bytes.extend_from_slice(data);
            }
            Self::WriteStdin(data) => bytes.extend_from_slice(data),
        }
        bytes
    }
}

/// Contents of the hub capabilities characteristic
///
/// ```text
/// [0-1]  : max write size (u16 little-endian)
/// [2-5]  : feature flags (u32 little-endian)
/// [6-9]  : max user program size (u32 little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCapabilities {
    pub max_write_size: usize,
    pub flags: u32,
    pub max_program_size: u32,
}

impl Default for HubCapabilities {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            flags: 0,
            max_program_size: u32::MAX,
        }
    }
}

pub fn parse_capabilities(bytes: &[u8]) -> Result<HubCapabilities> {
    if bytes.len() < 10 {
        bail!("Invalid capabilities size: {}", bytes.len());
    }
    let max_write_size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if max_write_size <= USER_RAM_HEADER_LEN {
        bail!("Hub max write size too small: {}", max_write_size);
    }
    Ok(HubCapabilities {
        max_write_size,
        flags: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        max_program_size: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
    })
}

/// Check that `program` is a compiled multi-file blob, the only program
/// format the firmware runs. Each module is laid out as
///
/// ```text
/// [0-3]  : size of the compiled module (u32 little-endian)
/// [4..]  : module name, NUL terminated
/// [..]   : compiled module: b'M', ABI version, ...
/// ```
///
/// Only the first module is checked.
pub fn check_program(program: &[u8]) -> Result<()> {
    if program.len() < 4 {
        bail!("Program is too short to be a compiled .mpy ({} bytes)", program.len());
    }
    let (size, rest) = program.split_at(4);
    let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize;
    let Some(name_end) = rest.iter().position(|b| *b == 0) else {
        bail!("Program is not a compiled multi-file .mpy: no module name");
    };
    let module = &rest[name_end + 1..];
    if size < 2 || module.len() < size {
        bail!(
            "Program is not a compiled multi-file .mpy: module claims {} bytes, {} present",
            size,
            module.len()
        );
    }
    if module[0] != b'M' || module[1] != MPY_ABI_VERSION {
        bail!(
            "Program is not a compiled .mpy for ABI {}; compile it with pybricksdev and set program_path",
            MPY_ABI_VERSION
        );
    }
    Ok(())
}

/// Full command sequence to upload and start a program.
///
/// The meta size is zeroed first so a partial upload is never started, then
/// the RAM is filled in chunks that fit one write, then the real size is set.
pub fn upload_sequence(program: &[u8], caps: &HubCapabilities) -> Result<Vec<PybricksCommand>> {
    if program.is_empty() {
        bail!("Program is empty");
    }
    let size = u32::try_from(program.len())?;
    if size > caps.max_program_size {
        bail!(
            "Program is {} bytes, hub accepts at most {}",
            size,
            caps.max_program_size
        );
    }
    check_program(program)?;

    let chunk_size = caps.max_write_size.saturating_sub(USER_RAM_HEADER_LEN).max(1);
    let mut commands = vec![
        PybricksCommand::StopUserProgram,
        PybricksCommand::WriteUserProgramMeta { size: 0 },
    ];
    for (i, chunk) in program.chunks(chunk_size).enumerate() {
        commands.push(PybricksCommand::WriteUserRam {
            offset: (i * chunk_size) as u32,
            data: chunk.to_vec(),
        });
    }
    commands.push(PybricksCommand::WriteUserProgramMeta { size });
    commands.push(PybricksCommand::StartUserProgram);
    Ok(commands)
}

/// Stdin writes for `data`, split to fit the hub's write size
pub fn stdin_writes(data: &[u8], caps: &HubCapabilities) -> Vec<PybricksCommand> {
    let chunk_size = caps.max_write_size.saturating_sub(STDIN_HEADER_LEN).max(1);
    data.chunks(chunk_size)
        .map(|chunk| PybricksCommand::WriteStdin(chunk.to_vec()))
        .collect()
}

/// Parse a UUID string into its 16 big-endian bytes
pub fn parse_uuid_bytes(uuid_str: &str) -> Result<[u8; 16]> {
    let hex = uuid_str.replace('-', "");
    if hex.len() != 32 || !hex.is_ascii() {
        bail!("Invalid UUID format: {}", uuid_str);
    }
    let mut bytes = [0u8; 16];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::DEFAULT_HUB_PROGRAM;

    /// A `__main__` module of `len` total blob bytes with a valid header
    fn compiled_program(len: usize) -> Vec<u8> {
        let name = b"__main__\0";
        let module_len = len - 4 - name.len();
        let mut blob = (module_len as u32).to_le_bytes().to_vec();
        blob.extend_from_slice(name);
        blob.extend_from_slice(&[b'M', MPY_ABI_VERSION]);
        blob.extend((0..module_len - 2).map(|i| i as u8));
        blob
    }

    #[test]
    fn stdin_command_prefixes_opcode() {
        assert_eq!(
            PybricksCommand::WriteStdin(b"w".to_vec()).encode(),
            vec![0x06, 0x77]
        );
    }

    #[test]
    fn meta_and_ram_are_little_endian() {
        assert_eq!(
            PybricksCommand::WriteUserProgramMeta { size: 0x0102 }.encode(),
            vec![0x03, 0x02, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            PybricksCommand::WriteUserRam {
                offset: 15,
                data: vec![0xAA]
            }
            .encode(),
            vec![0x04, 0x0F, 0x00, 0x00, 0x00, 0xAA]
        );
    }

    #[test]
    fn capabilities_parse() {
        let caps = parse_capabilities(&[
            0xF4, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00,
        ])
        .unwrap();
        assert_eq!(caps.max_write_size, 244);
        assert_eq!(caps.flags, 1);
        assert_eq!(caps.max_program_size, 0x8000);
        assert!(parse_capabilities(&[0x14, 0x00]).is_err());
    }

    #[test]
    fn upload_chunks_fit_one_write() {
        let caps = HubCapabilities::default();
        let program = compiled_program(40);
        let commands = upload_sequence(&program, &caps).unwrap();

        assert_eq!(commands[0], PybricksCommand::StopUserProgram);
        assert_eq!(commands[1], PybricksCommand::WriteUserProgramMeta { size: 0 });
        assert_eq!(
            commands[commands.len() - 2],
            PybricksCommand::WriteUserProgramMeta { size: 40 }
        );
        assert_eq!(commands.last(), Some(&PybricksCommand::StartUserProgram));

        let ram: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                PybricksCommand::WriteUserRam { offset, data } => Some((*offset, data.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ram.len(), 3);
        assert_eq!(ram[1].0, 15);
        let uploaded: Vec<u8> = ram.iter().flat_map(|(_, d)| d.iter().copied()).collect();
        assert_eq!(uploaded, program);
        for command in &commands {
            assert!(command.encode().len() <= caps.max_write_size);
        }
    }

    #[test]
    fn oversized_or_empty_program_is_rejected() {
        let caps = HubCapabilities {
            max_program_size: 4,
            ..Default::default()
        };
        assert!(upload_sequence(b"12345", &caps).is_err());
        assert!(upload_sequence(b"", &caps).is_err());
    }

    #[test]
    fn source_program_is_rejected() {
        let caps = HubCapabilities::default();
        let err = upload_sequence(DEFAULT_HUB_PROGRAM, &caps).unwrap_err();
        assert!(err.to_string().contains(".mpy"), "{}", err);
        assert!(check_program(b"print('hi')\n").is_err());
    }

    #[test]
    fn compiled_program_header_is_checked() {
        let program = compiled_program(32);
        assert!(check_program(&program).is_ok());

        let mut old_abi = program.clone();
        old_abi[4 + 9 + 1] = 5;
        assert!(check_program(&old_abi).is_err());

        assert!(check_program(&program[..20]).is_err());
        assert!(check_program(&[0x10, 0, 0]).is_err());
    }

    #[test]
    fn uuid_bytes() {
        let bytes = parse_uuid_bytes(SERVICE_UUID).unwrap();
        assert_eq!(&bytes[..4], &[0xc5, 0xf5, 0x00, 0x01]);
        assert!(parse_uuid_bytes("not-a-uuid").is_err());
    }
}
