//! Read-only consistency checks run before a volume is trusted for offline
//! mutation.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ChainFault, Result, TuneError};
use crate::ondisk::{SystemInode, Volume};

/// Fail on the first dirty journal, otherwise return the largest journal
/// size in clusters.
pub fn check_journals(vol: &dyn Volume) -> Result<u32> {
    let mut max_clusters = 0;
    for slot in 0..vol.super_block().max_slots {
        let blkno = vol.lookup_system_inode(SystemInode::Journal, slot)?;
        let di = vol.read_inode(blkno)?;
        if di.journal_dirty() {
            return Err(TuneError::JournalDirty { slot });
        }
        max_clusters = max_clusters.max(di.clusters);
    }
    debug!("Journals clean, largest is {max_clusters} clusters");
    Ok(max_clusters)
}

/// Walk every chain of the global bitmap and verify its bit accounting.
pub fn check_allocator(vol: &dyn Volume) -> Result<()> {
    let bm_blkno = vol.lookup_system_inode(SystemInode::GlobalBitmap, 0)?;
    let di = vol.read_inode(bm_blkno)?;
    let corrupt = |block, fault| TuneError::CorruptChain {
        allocator: SystemInode::GlobalBitmap,
        block,
        fault,
    };
    let chain_list = di
        .chain
        .as_ref()
        .ok_or_else(|| corrupt(bm_blkno, ChainFault::NoChainList))?;

    let mut seen = HashSet::new();
    for (index, rec) in chain_list.recs.iter().enumerate() {
        let chain = u16::try_from(index)
            .map_err(|_| TuneError::Internal(format!("chain index {index} out of range")))?;
        let (mut total, mut free) = (0u32, 0u32);

        let mut blkno = rec.blkno;
        while blkno != 0 {
            if !seen.insert(blkno) {
                return Err(corrupt(blkno, ChainFault::Cycle));
            }
            let gd = vol.read_group_desc(blkno)?;

            if gd.parent_dinode != bm_blkno {
                return Err(corrupt(
                    blkno,
                    ChainFault::BadParent {
                        expected: bm_blkno,
                        found: gd.parent_dinode,
                    },
                ));
            }
            if gd.chain != chain {
                return Err(corrupt(
                    blkno,
                    ChainFault::BadChainIndex {
                        expected: chain,
                        found: gd.chain,
                    },
                ));
            }
            if u32::from(gd.bits) > u32::from(gd.size) * 8 {
                return Err(corrupt(
                    blkno,
                    ChainFault::CapacityExceeded {
                        bits: gd.bits,
                        size: gd.size,
                    },
                ));
            }
            if gd.free_bits_count > gd.bits {
                return Err(corrupt(
                    blkno,
                    ChainFault::FreeExceedsTotal {
                        free: gd.free_bits_count,
                        total: gd.bits,
                    },
                ));
            }
            let counted = count_free_bits(&gd.bitmap, u32::from(gd.bits));
            if counted != u32::from(gd.free_bits_count) {
                return Err(corrupt(
                    blkno,
                    ChainFault::FreeCountMismatch {
                        counted,
                        stored: gd.free_bits_count,
                    },
                ));
            }

            total += u32::from(gd.bits);
            free += u32::from(gd.free_bits_count);
            blkno = gd.next_group;
        }

        if total != rec.total || free != rec.free {
            return Err(corrupt(
                bm_blkno,
                ChainFault::ChainTotalsMismatch {
                    chain,
                    counted_total: total,
                    counted_free: free,
                    stored_total: rec.total,
                    stored_free: rec.free,
                },
            ));
        }
    }

    debug!("Global bitmap at block {bm_blkno} is consistent");
    Ok(())
}

/// Sum the lengths of the maximal runs of clear bits among the first
/// `bits` bits. Bits past the end of `bitmap` count as set.
pub fn count_free_bits(bitmap: &[u8], bits: u32) -> u32 {
    let mut free = 0;
    let mut start = 0;
    while let Some(run_start) = find_next_clear(bitmap, bits, start) {
        let run_end = find_next_set(bitmap, bits, run_start).unwrap_or(bits);
        free += run_end - run_start;
        start = run_end;
    }
    free
}

fn test_bit(bitmap: &[u8], bit: u32) -> bool {
    bitmap
        .get((bit / 8) as usize)
        .is_none_or(|byte| byte & (1 << (bit % 8)) != 0)
}

fn find_next_clear(bitmap: &[u8], bits: u32, start: u32) -> Option<u32> {
    (start..bits).find(|&bit| !test_bit(bitmap, bit))
}

fn find_next_set(bitmap: &[u8], bits: u32, start: u32) -> Option<u32> {
    (start..bits).find(|&bit| test_bit(bitmap, bit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::image::{ImageBuilder, ImageIo, Record, VolumeImage};
    use crate::ondisk::{GroupDesc, OpenMode, StructureIo};

    fn open(image: &VolumeImage) -> (tempfile::TempDir, Box<dyn Volume>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        image.store(&path).unwrap();
        let vol = ImageIo.open(&path, OpenMode::ReadOnly).unwrap();
        (dir, vol)
    }

    fn first_group(image: &VolumeImage) -> u64 {
        let bm = image
            .inode(image.system_inode(SystemInode::GlobalBitmap, 0).unwrap())
            .unwrap();
        bm.chain.as_ref().unwrap().recs[0].blkno
    }

    fn corrupted_at(image: &VolumeImage) -> u64 {
        let (_dir, vol) = open(image);
        match check_allocator(vol.as_ref()) {
            Err(TuneError::CorruptChain { block, .. }) => block,
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_count_free_bits() {
        assert_eq!(count_free_bits(&[0x00, 0x00], 16), 16);
        assert_eq!(count_free_bits(&[0b0010_0001, 0x80], 16), 13);
        assert_eq!(count_free_bits(&[0xFF], 8), 0);
        assert_eq!(count_free_bits(&[0x00], 5), 5);
        // past the end of storage
        assert_eq!(count_free_bits(&[0x00], 12), 8);
    }

    #[test]
    fn test_journals_return_largest() {
        let mut image = ImageBuilder::new().slots(3).journal_clusters(32).build();
        let blkno = image.system_inode(SystemInode::Journal, 1).unwrap();
        image.inode_mut(blkno).unwrap().clusters = 80;

        let (_dir, vol) = open(&image);
        assert_eq!(check_journals(vol.as_ref()).unwrap(), 80);
    }

    #[test]
    fn test_dirty_journal_stops_scan() {
        let mut image = ImageBuilder::new().slots(4).dirty_journal(1).build();
        // a later slot that cannot be read must never be reached
        let broken = image.system_inode(SystemInode::Journal, 3).unwrap();
        image.records.remove(&broken);

        let (_dir, vol) = open(&image);
        assert!(matches!(
            check_journals(vol.as_ref()),
            Err(TuneError::JournalDirty { slot: 1 })
        ));
    }

    #[test]
    fn test_consistent_allocator_passes() {
        let image = ImageBuilder::new().groups(3, 8, 200, 37).build();
        let (_dir, vol) = open(&image);
        check_allocator(vol.as_ref()).unwrap();

        let empty = ImageBuilder::new().groups(1, 2, 64, 0).build();
        let (_dir, vol) = open(&empty);
        check_allocator(vol.as_ref()).unwrap();
    }

    fn with_group(image: &mut VolumeImage, blkno: u64, f: impl FnOnce(&mut GroupDesc)) {
        match image.records.get_mut(&blkno) {
            Some(Record::Group(gd)) => f(gd),
            _ => panic!("no group at {blkno}"),
        }
    }

    #[test]
    fn test_each_field_violation_names_the_group() {
        let base = ImageBuilder::new().groups(2, 4, 128, 8).build();
        let blkno = first_group(&base);

        let mutations: Vec<Box<dyn Fn(&mut GroupDesc)>> = vec![
            Box::new(|gd: &mut GroupDesc| gd.parent_dinode += 1),
            Box::new(|gd: &mut GroupDesc| gd.chain = 1),
            Box::new(|gd: &mut GroupDesc| gd.bits = gd.size * 8 + 1),
            Box::new(|gd: &mut GroupDesc| gd.free_bits_count = gd.bits + 1),
            Box::new(|gd: &mut GroupDesc| gd.free_bits_count -= 1),
            Box::new(|gd: &mut GroupDesc| gd.bitmap[3] = 0xFF),
        ];
        for mutate in mutations {
            let mut image = base.clone();
            with_group(&mut image, blkno, |gd| mutate(gd));
            assert_eq!(corrupted_at(&image), blkno);
        }
    }

    #[test]
    fn test_chain_record_mismatch_names_allocator() {
        let mut image = ImageBuilder::new().groups(2, 4, 128, 8).build();
        let bm_blkno = image.system_inode(SystemInode::GlobalBitmap, 0).unwrap();
        image.inode_mut(bm_blkno).unwrap().chain.as_mut().unwrap().recs[1].free += 1;
        assert_eq!(corrupted_at(&image), bm_blkno);
    }

    #[test]
    fn test_cycle_is_corruption() {
        let mut image = ImageBuilder::new().groups(1, 3, 64, 0).build();
        let head = first_group(&image);
        let second = match image.records.get(&head) {
            Some(Record::Group(gd)) => gd.next_group,
            _ => unreachable!(),
        };
        with_group(&mut image, second, |gd| gd.next_group = head);

        let (_dir, vol) = open(&image);
        assert!(matches!(
            check_allocator(vol.as_ref()),
            Err(TuneError::CorruptChain {
                fault: ChainFault::Cycle,
                ..
            })
        ));
    }
}
