//! Enable/disable operations for a single on-disk feature.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::error::{Result, TuneError};
use crate::handle::{FsHandle, OpenFlags};
use crate::runner::{Change, Operation};

pub type FeatureFn = fn(&mut FsHandle, OpenFlags) -> Result<Change>;

/// A feature that can be switched on and off. Each body checks the current
/// state itself and asks before writing.
pub struct Feature {
    pub name: &'static str,
    pub open_flags: OpenFlags,
    pub enable: FeatureFn,
    pub disable: FeatureFn,
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name)
            .field("open_flags", &self.open_flags)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeatureAction {
    #[default]
    Noop,
    Enable,
    Disable,
}

impl FromStr for FeatureAction {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enable" => Ok(FeatureAction::Enable),
            "disable" => Ok(FeatureAction::Disable),
            other => Err(TuneError::InvalidArgument(format!(
                "invalid action \"{other}\""
            ))),
        }
    }
}

#[derive(Debug)]
pub struct FeatureOp {
    feature: &'static Feature,
    action: FeatureAction,
}

impl FeatureOp {
    pub fn new(feature: &'static Feature) -> Self {
        FeatureOp {
            feature,
            action: FeatureAction::Noop,
        }
    }

    pub fn action(&self) -> FeatureAction {
        self.action
    }
}

impl Operation for FeatureOp {
    fn name(&self) -> &str {
        self.feature.name
    }

    fn open_flags(&self) -> OpenFlags {
        self.feature.open_flags
    }

    fn parse_option(&mut self, arg: Option<&str>) -> Result<()> {
        let arg =
            arg.ok_or_else(|| TuneError::InvalidArgument("no action specified".to_string()))?;
        self.action = arg.parse()?;
        Ok(())
    }

    fn run(&mut self, fs: &mut FsHandle, flags: OpenFlags) -> Result<Change> {
        match self.action {
            FeatureAction::Enable => (self.feature.enable)(fs, flags),
            FeatureAction::Disable => (self.feature.disable)(fs, flags),
            FeatureAction::Noop => {
                info!("Ran NOOP for feature \"{}\"", self.feature.name);
                Ok(Change::Unchanged)
            }
        }
    }
}
