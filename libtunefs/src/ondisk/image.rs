//! Volume image backend for the structural I/O interface.
//!
//! An image is an 8-byte magic followed by a bincode-encoded [`VolumeImage`]:
//! the superblock, the system-inode directory and a map from block number to
//! the inode or chain-group descriptor stored there. Every write rewrites the
//! whole image in place and syncs it before returning.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ChainList, ChainRec, ClusterInfo, DEFAULT_CLUSTER_STACK, Dinode, DynFeatures, GroupDesc,
    IncompatFeatures, JournalFlags, OpenMode, StructError, StructureIo, SuperBlock, SystemInode,
    TunefsFlags, Volume,
};

const IMAGE_MAGIC: [u8; 8] = *b"TUNEIMG1";
const FIRST_BLKNO: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Inode(Dinode),
    Group(GroupDesc),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeImage {
    pub super_block: SuperBlock,
    pub system_inodes: BTreeMap<(SystemInode, u16), u64>,
    pub records: BTreeMap<u64, Record>,
}

impl VolumeImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, StructError> {
        if bytes.len() < IMAGE_MAGIC.len() {
            return Err(StructError::ShortRead(bytes.len() as u64));
        }
        let (magic, payload) = bytes.split_at(IMAGE_MAGIC.len());
        if magic != IMAGE_MAGIC {
            return Err(StructError::BadMagic);
        }
        Ok(bincode::deserialize(payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StructError> {
        let mut bytes = IMAGE_MAGIC.to_vec();
        bytes.extend(bincode::serialize(self)?);
        Ok(bytes)
    }

    pub fn load(path: &Path) -> Result<Self, StructError> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes)
    }

    pub fn store(&self, path: &Path) -> Result<(), StructError> {
        let bytes = self.encode()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.write_all(&bytes)?;
        file.set_len(bytes.len() as u64)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn system_inode(&self, kind: SystemInode, slot: u16) -> Result<u64, StructError> {
        let slot = if kind.is_global() { 0 } else { slot };
        self.system_inodes
            .get(&(kind, slot))
            .copied()
            .ok_or_else(|| {
                StructError::NotFound(format!("system inode \"{}\"", kind.file_name(slot)))
            })
    }

    pub fn inode(&self, blkno: u64) -> Result<&Dinode, StructError> {
        match self.records.get(&blkno) {
            Some(Record::Inode(di)) => Ok(di),
            Some(Record::Group(_)) => Err(StructError::WrongRecord {
                blkno,
                expected: "inode",
            }),
            None => Err(StructError::NotFound(format!("inode at block {blkno}"))),
        }
    }

    pub fn inode_mut(&mut self, blkno: u64) -> Result<&mut Dinode, StructError> {
        match self.records.get_mut(&blkno) {
            Some(Record::Inode(di)) => Ok(di),
            Some(Record::Group(_)) => Err(StructError::WrongRecord {
                blkno,
                expected: "inode",
            }),
            None => Err(StructError::NotFound(format!("inode at block {blkno}"))),
        }
    }

    pub fn group(&self, blkno: u64) -> Result<&GroupDesc, StructError> {
        match self.records.get(&blkno) {
            Some(Record::Group(gd)) => Ok(gd),
            Some(Record::Inode(_)) => Err(StructError::WrongRecord {
                blkno,
                expected: "group descriptor",
            }),
            None => Err(StructError::NotFound(format!(
                "group descriptor at block {blkno}"
            ))),
        }
    }

    pub fn group_mut(&mut self, blkno: u64) -> Result<&mut GroupDesc, StructError> {
        match self.records.get_mut(&blkno) {
            Some(Record::Group(gd)) => Ok(gd),
            Some(Record::Inode(_)) => Err(StructError::WrongRecord {
                blkno,
                expected: "group descriptor",
            }),
            None => Err(StructError::NotFound(format!(
                "group descriptor at block {blkno}"
            ))),
        }
    }

    /// Take one bit from the global bitmap, keeping the group, the chain
    /// record and the bitmap in agreement.
    fn allocate_cluster(&mut self) -> Result<(), StructError> {
        let bm_blkno = self.system_inode(SystemInode::GlobalBitmap, 0)?;
        let recs = self
            .inode(bm_blkno)?
            .chain
            .as_ref()
            .map(|cl| cl.recs.clone())
            .unwrap_or_default();

        for (chain, rec) in recs.iter().enumerate() {
            if rec.free == 0 {
                continue;
            }

            let mut seen = HashSet::new();
            let mut blkno = rec.blkno;
            while blkno != 0 && seen.insert(blkno) {
                let gd = self.group_mut(blkno)?;
                let next = gd.next_group;
                let clear = if gd.free_bits_count > 0 {
                    (0..gd.bits).find(|&bit| !bit_is_set(&gd.bitmap, bit))
                } else {
                    None
                };
                if let Some(bit) = clear {
                    gd.bitmap[usize::from(bit / 8)] |= 1 << (bit % 8);
                    gd.free_bits_count -= 1;
                    let bm = self.inode_mut(bm_blkno)?;
                    if let Some(cl) = bm.chain.as_mut() {
                        cl.recs[chain].free -= 1;
                    }
                    return Ok(());
                }
                blkno = next;
            }
            return Err(StructError::CorruptChain(bm_blkno));
        }

        Err(StructError::NoSpace)
    }
}

fn bit_is_set(bitmap: &[u8], bit: u16) -> bool {
    bitmap
        .get(usize::from(bit / 8))
        .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
}

/// Opens volume image files.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageIo;

impl StructureIo for ImageIo {
    fn open(&self, device: &Path, mode: OpenMode) -> Result<Box<dyn Volume>, StructError> {
        if !device.exists() {
            return Err(StructError::NotFound(format!(
                "device \"{}\"",
                device.display()
            )));
        }
        let image = VolumeImage::load(device)?;
        debug!("Loaded volume image {}", device.display());
        Ok(Box::new(ImageVolume {
            path: device.to_path_buf(),
            image,
            mode,
        }))
    }
}

pub struct ImageVolume {
    path: PathBuf,
    image: VolumeImage,
    mode: OpenMode,
}

impl ImageVolume {
    fn persist(&self) -> Result<(), StructError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StructError::ReadOnly);
        }
        self.image.store(&self.path)
    }
}

impl Volume for ImageVolume {
    fn device(&self) -> &Path {
        &self.path
    }

    fn super_block(&self) -> &SuperBlock {
        &self.image.super_block
    }

    fn super_block_mut(&mut self) -> &mut SuperBlock {
        &mut self.image.super_block
    }

    fn write_super(&mut self) -> Result<(), StructError> {
        self.persist()
    }

    fn lookup_system_inode(&self, kind: SystemInode, slot: u16) -> Result<u64, StructError> {
        self.image.system_inode(kind, slot)
    }

    fn read_inode(&self, blkno: u64) -> Result<Dinode, StructError> {
        self.image.inode(blkno).cloned()
    }

    fn read_group_desc(&self, blkno: u64) -> Result<GroupDesc, StructError> {
        self.image.group(blkno).cloned()
    }

    fn make_journal(&mut self, blkno: u64, clusters: u32) -> Result<(), StructError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StructError::ReadOnly);
        }
        let di = self.image.inode_mut(blkno)?;
        di.clusters = clusters;
        di.journal_flags.remove(JournalFlags::DIRTY);
        self.persist()
    }

    fn for_each_inode(
        &self,
        f: &mut dyn FnMut(&Dinode) -> Result<(), StructError>,
    ) -> Result<(), StructError> {
        for record in self.image.records.values() {
            if let Record::Inode(di) = record {
                f(di)?;
            }
        }
        Ok(())
    }

    fn convert_inline_data(&mut self, blkno: u64) -> Result<(), StructError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StructError::ReadOnly);
        }
        if !self
            .image
            .inode(blkno)?
            .dyn_features
            .contains(DynFeatures::INLINE_DATA)
        {
            return Ok(());
        }
        self.image.allocate_cluster()?;
        let di = self.image.inode_mut(blkno)?;
        di.dyn_features.remove(DynFeatures::INLINE_DATA);
        di.clusters += 1;
        self.persist()
    }

    fn close(&mut self) -> Result<(), StructError> {
        Ok(())
    }
}

/// Lays out a fresh, internally consistent volume image.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    uuid: [u8; 16],
    label: String,
    block_size_bits: u8,
    cluster_size_bits: u8,
    slots: u16,
    journal_clusters: u32,
    dirty_slots: Vec<u16>,
    chains: u16,
    groups: u16,
    bits_per_group: u16,
    used_per_group: u16,
    incompat: IncompatFeatures,
    cluster_info: Option<ClusterInfo>,
    regular_files: u32,
    inline_files: u32,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder {
            uuid: [0x5A; 16],
            label: "tunefs-test".to_string(),
            block_size_bits: 12,
            cluster_size_bits: 12,
            slots: 2,
            journal_clusters: 64,
            dirty_slots: Vec::new(),
            chains: 2,
            groups: 4,
            bits_per_group: 256,
            used_per_group: 16,
            incompat: IncompatFeatures::LOCAL_MOUNT,
            cluster_info: None,
            regular_files: 2,
            inline_files: 0,
        }
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn slots(mut self, slots: u16) -> Self {
        self.slots = slots;
        self
    }

    pub fn journal_clusters(mut self, clusters: u32) -> Self {
        self.journal_clusters = clusters;
        self
    }

    pub fn dirty_journal(mut self, slot: u16) -> Self {
        self.dirty_slots.push(slot);
        self
    }

    /// `groups` descriptors of `bits_per_group` bits spread round-robin over
    /// `chains` chains, each with `used` bits already allocated.
    pub fn groups(mut self, chains: u16, groups: u16, bits_per_group: u16, used: u16) -> Self {
        self.chains = chains.max(1);
        self.groups = groups;
        self.bits_per_group = bits_per_group;
        self.used_per_group = used.min(bits_per_group);
        self
    }

    /// Make the volume clustered, managed by `stack`.
    pub fn cluster_stack(mut self, stack: &str, cluster: &str) -> Self {
        self.incompat.remove(IncompatFeatures::LOCAL_MOUNT);
        if stack != DEFAULT_CLUSTER_STACK {
            self.incompat.insert(IncompatFeatures::USERSPACE_STACK);
        }
        self.cluster_info = Some(ClusterInfo {
            stack: stack.to_string(),
            cluster: cluster.to_string(),
        });
        self
    }

    pub fn incompat(mut self, flags: IncompatFeatures) -> Self {
        self.incompat.insert(flags);
        self
    }

    pub fn regular_files(mut self, count: u32) -> Self {
        self.regular_files = count;
        self
    }

    /// Files still carrying their data inline; requires the feature bit.
    pub fn inline_files(mut self, count: u32) -> Self {
        self.inline_files = count;
        self
    }

    pub fn build(&self) -> VolumeImage {
        let mut next = FIRST_BLKNO;
        let mut alloc = || {
            let blkno = next;
            next += 1;
            blkno
        };

        let mut system_inodes = BTreeMap::new();
        let mut records = BTreeMap::new();

        let bm_blkno = alloc();
        system_inodes.insert((SystemInode::GlobalBitmap, 0), bm_blkno);

        for slot in 0..self.slots {
            let blkno = alloc();
            let journal_flags = if self.dirty_slots.contains(&slot) {
                JournalFlags::DIRTY
            } else {
                JournalFlags::empty()
            };
            system_inodes.insert((SystemInode::Journal, slot), blkno);
            records.insert(
                blkno,
                Record::Inode(Dinode {
                    blkno,
                    mode: libc::S_IFREG | 0o644,
                    clusters: self.journal_clusters,
                    dyn_features: DynFeatures::empty(),
                    journal_flags,
                    chain: None,
                }),
            );
        }

        let chains = self.chains.min(self.groups.max(1));
        let mut recs: Vec<ChainRec> = (0..chains)
            .map(|_| ChainRec {
                blkno: 0,
                total: 0,
                free: 0,
            })
            .collect();
        let mut tails: Vec<Option<u64>> = vec![None; usize::from(chains)];
        let bitmap_bytes = self.bits_per_group.div_ceil(8);

        for g in 0..self.groups {
            let blkno = alloc();
            let chain = g % chains;
            let mut bitmap = vec![0u8; usize::from(bitmap_bytes)];
            for bit in 0..self.used_per_group {
                bitmap[usize::from(bit / 8)] |= 1 << (bit % 8);
            }
            let free = self.bits_per_group - self.used_per_group;
            records.insert(
                blkno,
                Record::Group(GroupDesc {
                    blkno,
                    size: bitmap_bytes,
                    bits: self.bits_per_group,
                    free_bits_count: free,
                    parent_dinode: bm_blkno,
                    chain,
                    next_group: 0,
                    bitmap,
                }),
            );

            let idx = usize::from(chain);
            match tails[idx] {
                Some(tail) => {
                    if let Some(Record::Group(prev)) = records.get_mut(&tail) {
                        prev.next_group = blkno;
                    }
                }
                None => recs[idx].blkno = blkno,
            }
            tails[idx] = Some(blkno);
            recs[idx].total += u32::from(self.bits_per_group);
            recs[idx].free += u32::from(free);
        }

        let total: u32 = recs.iter().map(|rec| rec.total).sum();
        records.insert(
            bm_blkno,
            Record::Inode(Dinode {
                blkno: bm_blkno,
                mode: libc::S_IFREG | 0o644,
                clusters: total,
                dyn_features: DynFeatures::empty(),
                journal_flags: JournalFlags::empty(),
                chain: Some(ChainList { recs }),
            }),
        );

        for _ in 0..self.regular_files {
            let blkno = alloc();
            records.insert(
                blkno,
                Record::Inode(Dinode {
                    blkno,
                    mode: libc::S_IFREG | 0o644,
                    clusters: 1,
                    dyn_features: DynFeatures::empty(),
                    journal_flags: JournalFlags::empty(),
                    chain: None,
                }),
            );
        }

        let mut incompat = self.incompat;
        if self.inline_files > 0 {
            incompat.insert(IncompatFeatures::INLINE_DATA);
        }
        for i in 0..self.inline_files {
            let blkno = alloc();
            let mode = if i % 2 == 0 {
                libc::S_IFREG | 0o644
            } else {
                libc::S_IFDIR | 0o755
            };
            records.insert(
                blkno,
                Record::Inode(Dinode {
                    blkno,
                    mode,
                    clusters: 0,
                    dyn_features: DynFeatures::INLINE_DATA,
                    journal_flags: JournalFlags::empty(),
                    chain: None,
                }),
            );
        }

        VolumeImage {
            super_block: SuperBlock {
                uuid: self.uuid,
                label: self.label.clone(),
                block_size_bits: self.block_size_bits,
                cluster_size_bits: self.cluster_size_bits,
                max_slots: self.slots,
                feature_incompat: incompat,
                tunefs_flag: TunefsFlags::empty(),
                cluster_info: self.cluster_info.clone(),
            },
            system_inodes,
            records,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<VolumeImage, StructError> {
        let image = self.build();
        image.store(path)?;
        Ok(image)
    }
}
