//! The slice of the ustar format this tool needs: parsing the fixed 512-byte
//! header block that precedes every entry in the streams the server sends.

/*
 * Layout of the fields we read out of a header block -
 *
 * -------------+---------------+--------+------------------------------------+
 * | Field      |  Size(bytes)  | Offset |  Remarks                           |
 * +------------+---------------+--------+------------------------------------+
 * | <name>     |  100          |  0     |  NUL-terminated entry path         |
 * | <mode>     |  8            |  100   |  Permission bits, octal ASCII      |
 * | <size>     |  12           |  124   |  Body size in bytes, octal ASCII   |
 * | <typeflag> |  1            |  156   |  '0'/NUL file, '2' symlink, '5' dir|
 * | <linkname> |  100          |  157   |  NUL-terminated symlink target     |
 * +------------+---------------+--------+------------------------------------+
 *
 * Entry bodies are padded with zero bytes up to the next 512-byte boundary.
 * An archive ends with two all-zero blocks; the server's streams omit that
 * terminator, so the raw sink appends it itself.
 *
 * The header checksum at offset 148 is deliberately not validated, matching
 * the permissive behavior of the upstream client.
 */

use crate::error::{BackupError, Result};

/// Headers and padding are aligned to this everywhere in the format.
pub const BLOCK_SIZE: usize = 512;

/// Two empty blocks, written at the end of every archive file as required by
/// tar readers.
pub const EOA_MARKER: [u8; 1024] = [0u8; 1024];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlag {
    Regular,
    SymLink,
    Directory,
    /// Anything we do not support extracting; only an error when it shows up
    /// under a slash-terminated name.
    Other(u8),
}

impl TypeFlag {
    fn from_byte(byte: u8) -> Self {
        match byte {
            b'0' | 0 => TypeFlag::Regular,
            b'2' => TypeFlag::SymLink,
            b'5' => TypeFlag::Directory,
            other => TypeFlag::Other(other),
        }
    }
}

/// The parsed-out view of one header block.
#[derive(Debug, Clone)]
pub struct TarHeader {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub type_flag: TypeFlag,
    pub link_target: String,
}

impl TarHeader {
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() != BLOCK_SIZE {
            return Err(BackupError::Format(format!(
                "invalid tar block header size: {}",
                block.len()
            )));
        }
        let name = parse_cstr(&block[0..100])?;
        if name.is_empty() {
            return Err(BackupError::Format("empty file name in tar header".into()));
        }
        let mode = parse_octal(&block[100..108], "file mode")? as u32;
        let size = parse_octal(&block[124..136], "file size")?;
        let type_flag = TypeFlag::from_byte(block[156]);
        let link_target = parse_cstr(&block[157..257])?;
        Ok(Self {
            name,
            mode,
            size,
            type_flag,
            link_target,
        })
    }
}

/// Zero bytes following an entry body, rounding it up to a full block.
pub fn padding_for(size: u64) -> u64 {
    ((size + 511) & !511) - size
}

/// An all-zero header block is end-of-archive filler, not an entry.
pub fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|b| *b == 0)
}

fn parse_cstr(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| BackupError::Format("non-UTF-8 name in tar header".into()))
}

fn parse_octal(field: &[u8], what: &str) -> Result<u64> {
    let text = std::str::from_utf8(field)
        .map_err(|_| BackupError::Format(format!("could not parse {what}")))?;
    let text = text.trim_matches(|c| c == ' ' || c == '\0');
    if text.is_empty() {
        return Err(BackupError::Format(format!("could not parse {what}")));
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| BackupError::Format(format!("could not parse {what}: {text:?}")))
}
