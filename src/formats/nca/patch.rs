//! Hash-layer patch generation.
//!
//! When a payload inside an NCA section is rewritten in-flight (a CNMT
//! content record, a NACP policy byte), every hash-tree node covering the
//! changed bytes must be recomputed and emitted along with the data, and
//! the master hash in the section header must follow. This module walks
//! the section's hash layers bottom-up, reads the affected blocks, applies
//! the overlay, and registers the resulting byte ranges as encrypted
//! stream patches on the NCA.
//!
//! One patch per section: later patches would hash against the original
//! section data, not earlier overlays.

use sha2::{Digest, Sha256};
use std::io::{Read, Seek};

use super::{HashData, Nca};
use crate::error::Error;

/// A hash level: section-relative offset, size, and hashing block size.
#[derive(Debug, Clone, Copy)]
struct Layer {
    offset: u64,
    size: u64,
    block_size: u64,
}

/// Rewrites `new_data` at `section_offset` (section-relative, inside the
/// data layer) and propagates hashes up the section's tree. All resulting
/// byte ranges are registered as stream patches; the refreshed master hash
/// lands in the section header and the main header's FS-header hash.
pub fn generate_hash_data_patch<R: Read + Seek>(
    nca: &mut Nca<R>,
    section_idx: usize,
    section_offset: u64,
    new_data: &[u8],
) -> Result<(), Error> {
    if new_data.is_empty() {
        return Ok(());
    }

    let section = nca.section(section_idx)?;
    let layers = collect_layers(&section.header.hash_data);

    // Bottom-up: the data level first, then each hash level it dirties.
    let mut pending: Vec<(u64, Vec<u8>)> = vec![(section_offset, new_data.to_vec())];

    let mut level = layers.len();
    while level >= 2 {
        let child = layers[level - 1];
        let parent = layers[level - 2];
        let (patch_offset, patch_data) = pending.last().expect("seeded above").clone();

        let rel = patch_offset
            .checked_sub(child.offset)
            .ok_or_else(|| Error::InvalidArgument("patch outside hash layer".into()))?;
        if rel + patch_data.len() as u64 > child.size {
            return Err(Error::InvalidArgument("patch exceeds hash layer".into()));
        }

        let first_block = rel / child.block_size;
        let last_block = (rel + patch_data.len() as u64 - 1) / child.block_size;

        let mut parent_bytes = Vec::with_capacity(((last_block - first_block + 1) * 0x20) as usize);
        for block in first_block..=last_block {
            let block_offset = child.offset + block * child.block_size;
            let block_len = child.block_size.min(child.size - block * child.block_size);

            let mut block_data = vec![0u8; block_len as usize];
            nca.read_section(section_idx, block_offset, &mut block_data)?;
            overlay(&mut block_data, block_offset, &patch_data, patch_offset);

            parent_bytes.extend_from_slice(&Sha256::digest(&block_data));
        }

        pending.push((parent.offset + first_block * 0x20, parent_bytes));
        level -= 1;
    }

    // Master hash: over the topmost hash layer with its patch applied.
    if let Some(&top) = layers.first() {
        let (patch_offset, patch_data) = pending.last().expect("seeded above").clone();
        let mut top_bytes = vec![0u8; top.size as usize];
        nca.read_section(section_idx, top.offset, &mut top_bytes)?;
        overlay(&mut top_bytes, top.offset, &patch_data, patch_offset);
        let master: [u8; 0x20] = Sha256::digest(&top_bytes).into();

        let section = nca
            .fs_sections
            .iter_mut()
            .find(|s| s.section_idx == section_idx)
            .expect("section exists");
        match &mut section.header.hash_data {
            HashData::HierarchicalSha256 { master_hash, .. } => *master_hash = master,
            HashData::HierarchicalIntegrity { master_hash, .. } => *master_hash = master,
            HashData::None { .. } => {}
        }
        nca.resync_raw_header(Some(section_idx));
    }

    for (offset, data) in pending {
        nca.register_section_patch(section_idx, offset, &data)?;
    }

    Ok(())
}

/// Layers ordered top (first hashed-over layer) to bottom (data layer).
fn collect_layers(hash_data: &HashData) -> Vec<Layer> {
    match hash_data {
        HashData::HierarchicalSha256 {
            hash_block_size,
            hash_table_offset,
            hash_table_size,
            pfs0_offset,
            pfs0_size,
            ..
        } => vec![
            Layer {
                offset: *hash_table_offset,
                size: *hash_table_size,
                block_size: *hash_block_size as u64,
            },
            Layer {
                offset: *pfs0_offset,
                size: *pfs0_size,
                block_size: *hash_block_size as u64,
            },
        ],
        HashData::HierarchicalIntegrity {
            info_level_hash, ..
        } => info_level_hash
            .levels
            .iter()
            .map(|l| Layer {
                offset: l.offset,
                size: l.size,
                block_size: 1u64 << l.block_size_log2,
            })
            .collect(),
        HashData::None { .. } => Vec::new(),
    }
}

/// Copies the overlap of `patch` (at `patch_offset`) onto `block` (at
/// `block_offset`); offsets share the section-relative address space.
fn overlay(block: &mut [u8], block_offset: u64, patch: &[u8], patch_offset: u64) {
    let block_end = block_offset + block.len() as u64;
    let patch_end = patch_offset + patch.len() as u64;
    let start = block_offset.max(patch_offset);
    let end = block_end.min(patch_end);
    if start < end {
        let dst = (start - block_offset) as usize..(end - block_offset) as usize;
        let src = (start - patch_offset) as usize..(end - patch_offset) as usize;
        block[dst].copy_from_slice(&patch[src]);
    }
}
