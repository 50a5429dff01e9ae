use tracing::{debug, info};

use crate::error::{Result, TuneError};
use crate::handle::{FsHandle, InProgress, OpenFlags};
use crate::ondisk::{SystemInode, TunefsFlags};
use crate::runner::{Change, Operation};

/// Resize every slot's journal to one size.
#[derive(Debug, Default)]
pub struct JournalSizeOp {
    /// Requested size in bytes; zero means the largest existing journal.
    size: u64,
}

impl JournalSizeOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Operation for JournalSizeOp {
    fn name(&self) -> &str {
        "journal-size"
    }

    fn open_flags(&self) -> OpenFlags {
        OpenFlags::RW | OpenFlags::ALLOCATION
    }

    fn parse_option(&mut self, arg: Option<&str>) -> Result<()> {
        self.size = match arg {
            Some(arg) => parse_size(arg)?,
            None => 0,
        };
        Ok(())
    }

    fn run(&mut self, fs: &mut FsHandle, _flags: OpenFlags) -> Result<Change> {
        let clusters = if self.size == 0 {
            u64::from(fs.journal_clusters())
        } else {
            fs.super_block().clusters_in_bytes(self.size)
        };
        let clusters = u32::try_from(clusters).map_err(|_| {
            TuneError::InvalidArgument(format!("journal size {} is too large", self.size))
        })?;
        if clusters == 0 {
            return Err(TuneError::InvalidArgument(
                "cannot size journals to zero clusters".to_string(),
            ));
        }

        let mut pending = Vec::new();
        for slot in 0..fs.max_slots() {
            let blkno = fs
                .volume()
                .lookup_system_inode(SystemInode::Journal, slot)?;
            if fs.volume().read_inode(blkno)?.clusters != clusters {
                pending.push((slot, blkno));
            }
        }
        if pending.is_empty() {
            info!("All journals are already {clusters} clusters; nothing to resize");
            return Ok(Change::Unchanged);
        }

        if !fs.interact(&format!(
            "Resize the journals on device \"{}\" to {clusters} clusters?",
            fs.device().display()
        )) {
            return Ok(Change::Declined);
        }

        let marker = InProgress::Tunefs(TunefsFlags::JOURNAL_RESIZE);
        fs.set_in_progress(marker)?;
        for (slot, blkno) in pending {
            debug!(
                "Resizing journal \"{}\" to {clusters} clusters",
                SystemInode::Journal.file_name(slot)
            );
            fs.volume_mut().make_journal(blkno, clusters)?;
        }
        fs.clear_in_progress(marker)?;
        Ok(Change::Applied)
    }
}

/// Parse a byte count: decimal, `0x` hex or leading-zero octal, optionally
/// followed by one of `K`, `M`, `G`, `T`, `P` (binary multiples) or `B`.
pub fn parse_size(arg: &str) -> Result<u64> {
    let invalid = || TuneError::InvalidNumber(arg.to_string());
    let text = arg.trim_start();

    let (radix, body) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_hexdigit()))
    {
        (16, hex)
    } else if text.starts_with('0') {
        (8, text)
    } else {
        (10, text)
    };

    let digits_end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    if digits_end == 0 {
        return Err(invalid());
    }
    let value = u64::from_str_radix(&body[..digits_end], radix).map_err(|_| invalid())?;

    let shift = match &body[digits_end..] {
        "" | "b" | "B" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        _ => return Err(invalid()),
    };
    value.checked_mul(1 << shift).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("8M").unwrap(), 8 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_size("1P").unwrap(), 1 << 50);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn test_parse_size_bases() {
        assert_eq!(parse_size("0x10").unwrap(), 16);
        assert_eq!(parse_size("0X1fM").unwrap(), 31 << 20);
        assert_eq!(parse_size("010").unwrap(), 8);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_rejects() {
        for bad in ["", "K", "12Q", "08", "0x", "-1", "64KB", "99999999999999999999"] {
            assert!(
                matches!(parse_size(bad), Err(TuneError::InvalidNumber(_))),
                "{bad} should be rejected"
            );
        }
        assert!(parse_size("16384P").is_err());
    }
}
