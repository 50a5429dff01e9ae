use tracing::{debug, info};

use crate::error::{Result, TuneError};
use crate::feature::Feature;
use crate::handle::{FsHandle, OpenFlags};
use crate::ondisk::{DynFeatures, IncompatFeatures};
use crate::runner::Change;

pub static INLINE_DATA: Feature = Feature {
    name: "inline-data",
    open_flags: OpenFlags::RW.union(OpenFlags::ALLOCATION),
    enable: enable_inline_data,
    disable: disable_inline_data,
};

fn enable_inline_data(fs: &mut FsHandle, _flags: OpenFlags) -> Result<Change> {
    if fs
        .super_block()
        .feature_incompat
        .contains(IncompatFeatures::INLINE_DATA)
    {
        info!("The inline data feature is already enabled; nothing to enable");
        return Ok(Change::Unchanged);
    }

    if !fs.interact(&format!(
        "Enable the inline data feature on device \"{}\"?",
        fs.device().display()
    )) {
        return Ok(Change::Declined);
    }

    fs.super_block_mut()
        .feature_incompat
        .insert(IncompatFeatures::INLINE_DATA);
    fs.write_super()?;
    Ok(Change::Applied)
}

fn disable_inline_data(fs: &mut FsHandle, _flags: OpenFlags) -> Result<Change> {
    if !fs
        .super_block()
        .feature_incompat
        .contains(IncompatFeatures::INLINE_DATA)
    {
        info!("The inline data feature is not enabled; nothing to disable");
        return Ok(Change::Unchanged);
    }

    if !fs.interact(&format!(
        "Disable the inline data feature on device \"{}\"?",
        fs.device().display()
    )) {
        return Ok(Change::Declined);
    }

    let inodes = find_inline_data(fs)?;
    for &blkno in &inodes {
        fs.volume_mut().convert_inline_data(blkno)?;
    }
    debug!("Expanded {} inodes", inodes.len());

    fs.super_block_mut()
        .feature_incompat
        .remove(IncompatFeatures::INLINE_DATA);
    fs.write_super()?;
    Ok(Change::Applied)
}

/// Files and directories still holding inline data, once space for all of
/// them is known to be there.
fn find_inline_data(fs: &FsHandle) -> Result<Vec<u64>> {
    let mut inodes = Vec::new();
    fs.volume().for_each_inode(&mut |di| {
        if (di.is_regular() || di.is_dir()) && di.dyn_features.contains(DynFeatures::INLINE_DATA)
        {
            inodes.push(di.blkno);
        }
        Ok(())
    })?;

    let needed = inodes.len() as u64;
    let free = fs.free_clusters()?;
    info!(
        "We have {free} clusters free, and need {needed} clusters to expand all inline data"
    );
    if free < needed {
        return Err(TuneError::NoSpace { needed, free });
    }
    Ok(inodes)
}
