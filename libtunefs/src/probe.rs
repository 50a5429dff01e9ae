//! Open-mode diagnostics: try each way of opening a device and report how
//! it went.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::handle::{OpenFlags, OpenOutcome};
use crate::session::Session;

#[derive(Debug)]
pub struct ProbeEntry {
    pub mode: &'static str,
    pub flags: OpenFlags,
    /// The outcome, or the rendered open or close error.
    pub result: Result<OpenOutcome, String>,
}

impl ProbeEntry {
    fn verdict(&self) -> String {
        match &self.result {
            Err(e) => format!("failed: {e}"),
            Ok(outcome) if self.flags.contains(OpenFlags::ONLINE) => match outcome {
                OpenOutcome::Online => "operation would have been online".to_string(),
                _ => "operation would have been offline".to_string(),
            },
            Ok(outcome) if self.flags.contains(OpenFlags::NOCLUSTER) => match outcome {
                OpenOutcome::NoClusterStack => "expected cluster stack mismatch found".to_string(),
                _ => "cluster stacks already match".to_string(),
            },
            Ok(_) => "success".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ProbeReport {
    pub device: PathBuf,
    pub entries: Vec<ProbeEntry>,
}

impl ProbeReport {
    pub fn all_opened(&self) -> bool {
        self.entries.iter().all(|entry| entry.result.is_ok())
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "Opening device \"{}\" {}... {}",
                self.device.display(),
                entry.mode,
                entry.verdict()
            )?;
        }
        Ok(())
    }
}

const MODES: [(&str, OpenFlags); 4] = [
    ("read-only", OpenFlags::empty()),
    ("read-write", OpenFlags::RW),
    (
        "for an online operation",
        OpenFlags::RW.union(OpenFlags::ONLINE),
    ),
    (
        "for a stackless operation",
        OpenFlags::RW.union(OpenFlags::NOCLUSTER),
    ),
];

/// Open and immediately close `device` in every mode.
pub fn probe(session: &Session, device: &Path) -> ProbeReport {
    let entries = MODES
        .iter()
        .map(|&(mode, flags)| {
            let result = session
                .open(device, flags)
                .and_then(|fs| {
                    let outcome = fs.outcome();
                    fs.close().map(|()| outcome)
                })
                .map_err(|e| e.to_string());
            ProbeEntry {
                mode,
                flags,
                result,
            }
        })
        .collect();

    ProbeReport {
        device: device.to_path_buf(),
        entries,
    }
}
