//! RomFS: the Switch's read-only indexed filesystem.
//!
//! Four tables (directory hash buckets, directory entries, file hash
//! buckets, file entries) plus a file-data body. Entries are addressed by
//! byte offset into their table, and path resolution goes through the hash
//! buckets with a rotate-xor hash of `(parent_offset, name)`.
//!
//! The tables are small relative to the body, so they are held in memory;
//! only file-data reads touch the underlying reader.

use binrw::BinReaderExt;
use std::io::{Read, Seek, SeekFrom};

use crate::error::Error;

pub const ROMFS_HEADER_SIZE: u64 = 0x50;

/// Magic value for invalid entry offsets
pub const INVALID_ENTRY: u32 = u32::MAX;
/// Offset of the root directory
pub const ROOT_DIR_OFFSET: u32 = 0;

const DIR_ENTRY_FIXED_SIZE: usize = 0x18;
const FILE_ENTRY_FIXED_SIZE: usize = 0x20;

/// RomFS header structure (all fields are 64-bit offsets/sizes)
#[derive(Debug, Clone, binrw::BinRead, binrw::BinWrite)]
#[brw(little)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u64,
    pub dir_table_offset: u64,
    pub dir_table_size: u64,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u64,
    pub file_table_offset: u64,
    pub file_table_size: u64,
    pub file_data_offset: u64,
}

/// Directory entry structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Byte offset of this entry within the directory table.
    pub entry_offset: u32,
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub child_dir_offset: u32,
    pub child_file_offset: u32,
    pub hash_sibling_offset: u32,
    pub name: String,
}

/// File entry structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Byte offset of this entry within the file table.
    pub entry_offset: u32,
    pub parent_offset: u32,
    pub sibling_offset: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub hash_sibling_offset: u32,
    pub name: String,
}

/// RomFS representation
#[derive(Debug)]
pub struct RomFs<R: Read + Seek> {
    reader: R,
    pub header: RomFsHeader,
    dir_hash_table: Vec<u32>,
    file_hash_table: Vec<u32>,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
}

impl<R: Read + Seek> RomFs<R> {
    /// Create a new RomFS from a reader positioned over the image.
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;
        let header: RomFsHeader = reader.read_le()?;

        if header.header_size != ROMFS_HEADER_SIZE {
            return Err(Error::InvalidNca(format!(
                "invalid RomFS header size {:#x}",
                header.header_size
            )));
        }

        let image_size = reader.seek(SeekFrom::End(0))?;
        for (offset, size, what) in [
            (header.dir_hash_table_offset, header.dir_hash_table_size, "dir hash table"),
            (header.dir_table_offset, header.dir_table_size, "dir table"),
            (header.file_hash_table_offset, header.file_hash_table_size, "file hash table"),
            (header.file_table_offset, header.file_table_size, "file table"),
        ] {
            if offset + size > image_size {
                return Err(Error::InvalidNca(format!(
                    "RomFS {} exceeds image bounds",
                    what
                )));
            }
        }

        let dir_hash_table = read_u32_table(
            &mut reader,
            header.dir_hash_table_offset,
            header.dir_hash_table_size,
        )?;
        let file_hash_table = read_u32_table(
            &mut reader,
            header.file_hash_table_offset,
            header.file_hash_table_size,
        )?;

        let mut dir_table = vec![0u8; header.dir_table_size as usize];
        reader.seek(SeekFrom::Start(header.dir_table_offset))?;
        reader.read_exact(&mut dir_table)?;

        let mut file_table = vec![0u8; header.file_table_size as usize];
        reader.seek(SeekFrom::Start(header.file_table_offset))?;
        reader.read_exact(&mut file_table)?;

        tracing::trace!(
            dir_count_buckets = dir_hash_table.len(),
            file_count_buckets = file_hash_table.len(),
            dir_table_size = dir_table.len(),
            file_table_size = file_table.len(),
            "RomFS tables loaded"
        );

        Ok(Self {
            reader,
            header,
            dir_hash_table,
            file_hash_table,
            dir_table,
            file_table,
        })
    }

    /// Read a directory entry from the in-memory directory table
    pub fn read_dir_entry(&self, offset: u32) -> Result<DirectoryEntry, Error> {
        let table = &self.dir_table;
        let base = offset as usize;
        if base + DIR_ENTRY_FIXED_SIZE > table.len() {
            return Err(Error::InvalidNca(format!(
                "directory entry offset {:#x} outside table",
                offset
            )));
        }

        let u32_at = |o: usize| u32::from_le_bytes(table[o..o + 4].try_into().unwrap());

        let name_size = u32_at(base + 0x14) as usize;
        let name_start = base + DIR_ENTRY_FIXED_SIZE;
        if name_start + name_size > table.len() {
            return Err(Error::InvalidNca("directory name outside table".into()));
        }

        Ok(DirectoryEntry {
            entry_offset: offset,
            parent_offset: u32_at(base),
            sibling_offset: u32_at(base + 0x4),
            child_dir_offset: u32_at(base + 0x8),
            child_file_offset: u32_at(base + 0xC),
            hash_sibling_offset: u32_at(base + 0x10),
            name: std::str::from_utf8(&table[name_start..name_start + name_size])?.to_string(),
        })
    }

    /// Read a file entry from the in-memory file table
    pub fn read_file_entry(&self, offset: u32) -> Result<FileEntry, Error> {
        let table = &self.file_table;
        let base = offset as usize;
        if base + FILE_ENTRY_FIXED_SIZE > table.len() {
            return Err(Error::InvalidNca(format!(
                "file entry offset {:#x} outside table",
                offset
            )));
        }

        let u32_at = |o: usize| u32::from_le_bytes(table[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(table[o..o + 8].try_into().unwrap());

        let name_size = u32_at(base + 0x1C) as usize;
        let name_start = base + FILE_ENTRY_FIXED_SIZE;
        if name_start + name_size > table.len() {
            return Err(Error::InvalidNca("file name outside table".into()));
        }

        Ok(FileEntry {
            entry_offset: offset,
            parent_offset: u32_at(base),
            sibling_offset: u32_at(base + 0x4),
            data_offset: u64_at(base + 0x8),
            data_size: u64_at(base + 0x10),
            hash_sibling_offset: u32_at(base + 0x18),
            name: std::str::from_utf8(&table[name_start..name_start + name_size])?.to_string(),
        })
    }

    /// Compute the hash-bucket index for (parent offset, name)
    fn compute_hash(parent: u32, name: &[u8], table_size: usize) -> u32 {
        let mut hash = parent ^ 123456789;
        for &b in name {
            hash = hash.rotate_right(5);
            hash ^= b as u32;
        }
        hash % (table_size as u32)
    }

    /// Find a directory by its path
    pub fn find_dir(&self, path: &str) -> Result<u32, Error> {
        let mut current_dir = ROOT_DIR_OFFSET;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current_dir = self.find_dir_in_parent(current_dir, part)?;
        }
        Ok(current_dir)
    }

    fn find_dir_in_parent(&self, parent_offset: u32, name: &str) -> Result<u32, Error> {
        let hash = Self::compute_hash(parent_offset, name.as_bytes(), self.dir_hash_table.len());

        let mut current_offset = self.dir_hash_table[hash as usize];
        while current_offset != INVALID_ENTRY {
            let entry = self.read_dir_entry(current_offset)?;
            if entry.parent_offset == parent_offset && entry.name == name {
                return Ok(current_offset);
            }
            current_offset = entry.hash_sibling_offset;
        }

        Err(Error::NotFound(format!("directory '{}'", name)))
    }

    /// Find a file by its path
    pub fn find_file(&self, path: &str) -> Result<FileEntry, Error> {
        let trimmed = path.trim_end_matches('/');
        let (parent_path, file_name) = match trimmed.rfind('/') {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if file_name.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid path: {}", path)));
        }

        let parent_offset = self.find_dir(parent_path)?;
        self.find_file_in_dir(parent_offset, file_name)
    }

    fn find_file_in_dir(&self, parent_offset: u32, name: &str) -> Result<FileEntry, Error> {
        let hash = Self::compute_hash(parent_offset, name.as_bytes(), self.file_hash_table.len());

        let mut current_offset = self.file_hash_table[hash as usize];
        while current_offset != INVALID_ENTRY {
            let entry = self.read_file_entry(current_offset)?;
            if entry.parent_offset == parent_offset && entry.name == name {
                return Ok(entry);
            }
            current_offset = entry.hash_sibling_offset;
        }

        Err(Error::NotFound(format!("file '{}'", name)))
    }

    /// Check if a file exists by path
    pub fn file_exists(&self, path: &str) -> bool {
        self.find_file(path).is_ok()
    }

    /// Check if a directory exists by path
    pub fn dir_exists(&self, path: &str) -> bool {
        self.find_dir(path).is_ok()
    }

    /// Children of a directory: (subdirectories, files), in sibling order.
    pub fn read_children(&self, dir_offset: u32) -> Result<(Vec<DirectoryEntry>, Vec<FileEntry>), Error> {
        let dir = self.read_dir_entry(dir_offset)?;

        let mut dirs = Vec::new();
        let mut current = dir.child_dir_offset;
        while current != INVALID_ENTRY {
            let entry = self.read_dir_entry(current)?;
            current = entry.sibling_offset;
            dirs.push(entry);
        }

        let mut files = Vec::new();
        let mut current = dir.child_file_offset;
        while current != INVALID_ENTRY {
            let entry = self.read_file_entry(current)?;
            current = entry.sibling_offset;
            files.push(entry);
        }

        Ok((dirs, files))
    }

    /// Reconstructs the absolute path of a file entry by walking parents.
    pub fn path_for_file_entry(&self, entry: &FileEntry) -> Result<String, Error> {
        let mut components = vec![entry.name.clone()];
        let mut dir_offset = entry.parent_offset;
        while dir_offset != ROOT_DIR_OFFSET {
            let dir = self.read_dir_entry(dir_offset)?;
            components.push(dir.name.clone());
            dir_offset = dir.parent_offset;
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Every file entry in table order (entries are 4-byte aligned records).
    pub fn list_file_entries(&self) -> Result<Vec<FileEntry>, Error> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset + (FILE_ENTRY_FIXED_SIZE as u64) <= self.file_table.len() as u64 {
            let entry = self.read_file_entry(offset as u32)?;
            let entry_size = crate::io::align_up(
                FILE_ENTRY_FIXED_SIZE as u64 + entry.name.len() as u64,
                4,
            );
            offset += entry_size;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Sum of all file sizes in the image.
    pub fn total_data_size(&self) -> Result<u64, Error> {
        Ok(self.list_file_entries()?.iter().map(|e| e.data_size).sum())
    }

    /// Reads part of a file entry's data.
    pub fn read_file_data(
        &mut self,
        entry: &FileEntry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        if offset + buf.len() as u64 > entry.data_size {
            return Err(Error::InvalidArgument("read past file end".into()));
        }
        self.reader.seek(SeekFrom::Start(
            self.header.file_data_offset + entry.data_offset + offset,
        ))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }

    /// Extract a whole file from the RomFS by path.
    pub fn extract_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let entry = self.find_file(path)?;
        let mut data = vec![0u8; entry.data_size as usize];
        self.read_file_data(&entry, 0, &mut data)?;
        Ok(data)
    }
}

fn read_u32_table<R: Read + Seek>(reader: &mut R, offset: u64, size: u64) -> Result<Vec<u32>, Error> {
    reader.seek(SeekFrom::Start(offset))?;
    let count = size as usize / std::mem::size_of::<u32>();
    let mut raw = vec![0u8; count * 4];
    reader.read_exact(&mut raw)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Test-only RomFS image builder. Produces byte-exact images with working
/// hash chains, used by the RomFS, NACP, BKTR and NSP tests.
#[cfg(test)]
pub(crate) mod builder {
    use super::*;
    use binrw::BinWrite;

    struct DirNode {
        path: String,
        name: String,
        parent: usize,
        entry_offset: u32,
    }

    struct FileNode {
        parent: usize,
        name: String,
        data: Vec<u8>,
        entry_offset: u32,
        data_offset: u64,
    }

    /// Builds a RomFS image from `(path, bytes)` pairs. Parent directories
    /// are created implicitly; paths use `/` separators.
    pub fn build_romfs(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut dirs: Vec<DirNode> = vec![DirNode {
            path: String::new(),
            name: String::new(),
            parent: 0,
            entry_offset: 0,
        }];
        let mut file_nodes: Vec<FileNode> = Vec::new();

        let mut dir_index = |path: &str, dirs: &mut Vec<DirNode>| -> usize {
            if path.is_empty() {
                return 0;
            }
            if let Some(i) = dirs.iter().position(|d| d.path == path) {
                return i;
            }
            // Create parents first.
            let (parent_path, name) = match path.rfind('/') {
                Some(pos) => (&path[..pos], &path[pos + 1..]),
                None => ("", path),
            };
            let parent = if parent_path.is_empty() {
                0
            } else {
                dirs.iter()
                    .position(|d| d.path == parent_path)
                    .expect("parents created in order")
            };
            dirs.push(DirNode {
                path: path.to_string(),
                name: name.to_string(),
                parent,
                entry_offset: 0,
            });
            dirs.len() - 1
        };

        for (path, data) in files {
            let trimmed = path.trim_start_matches('/');
            let (dir_path, name) = match trimmed.rfind('/') {
                Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
                None => ("", trimmed),
            };
            // Materialise every ancestor.
            let mut partial = String::new();
            for comp in dir_path.split('/').filter(|c| !c.is_empty()) {
                if !partial.is_empty() {
                    partial.push('/');
                }
                partial.push_str(comp);
                dir_index(&partial, &mut dirs);
            }
            let parent = dir_index(dir_path, &mut dirs);
            file_nodes.push(FileNode {
                parent,
                name: name.to_string(),
                data: data.to_vec(),
                entry_offset: 0,
                data_offset: 0,
            });
        }

        // Assign entry offsets (records are 4-byte aligned).
        let mut offset = 0u32;
        for dir in dirs.iter_mut() {
            dir.entry_offset = offset;
            offset += crate::io::align_up(0x18 + dir.name.len() as u64, 4) as u32;
        }
        let dir_table_size = offset as u64;

        let mut offset = 0u32;
        let mut data_offset = 0u64;
        for file in file_nodes.iter_mut() {
            file.entry_offset = offset;
            offset += crate::io::align_up(0x20 + file.name.len() as u64, 4) as u32;
            file.data_offset = data_offset;
            data_offset += file.data.len() as u64;
        }
        let file_table_size = offset as u64;

        // Sibling / child chains.
        let child_dirs = |parent: usize| {
            dirs.iter()
                .enumerate()
                .skip(1)
                .filter(move |(i, d)| d.parent == parent && *i != parent)
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        let child_files = |parent: usize| {
            file_nodes
                .iter()
                .enumerate()
                .filter(move |(_, f)| f.parent == parent)
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };

        // Hash chains (one bucket per entry keeps chains short but real).
        let dir_bucket_count = dirs.len().max(1);
        let file_bucket_count = file_nodes.len().max(1);
        let mut dir_buckets = vec![INVALID_ENTRY; dir_bucket_count];
        let mut dir_hash_next = vec![INVALID_ENTRY; dirs.len()];
        for (i, dir) in dirs.iter().enumerate() {
            let parent_offset = dirs[dir.parent].entry_offset;
            let key_parent = if i == 0 { 0 } else { parent_offset };
            let h = RomFs::<std::io::Cursor<Vec<u8>>>::compute_hash(
                key_parent,
                dir.name.as_bytes(),
                dir_bucket_count,
            ) as usize;
            dir_hash_next[i] = dir_buckets[h];
            dir_buckets[h] = dir.entry_offset;
        }
        let mut file_buckets = vec![INVALID_ENTRY; file_bucket_count];
        let mut file_hash_next = vec![INVALID_ENTRY; file_nodes.len()];
        for (i, file) in file_nodes.iter().enumerate() {
            let parent_offset = dirs[file.parent].entry_offset;
            let h = RomFs::<std::io::Cursor<Vec<u8>>>::compute_hash(
                parent_offset,
                file.name.as_bytes(),
                file_bucket_count,
            ) as usize;
            file_hash_next[i] = file_buckets[h];
            file_buckets[h] = file.entry_offset;
        }

        // Serialise tables.
        let mut dir_table = Vec::new();
        for (i, dir) in dirs.iter().enumerate() {
            let children = child_dirs(i);
            let files_in = child_files(i);
            let sibling = if i == 0 {
                INVALID_ENTRY
            } else {
                let siblings = child_dirs(dir.parent);
                let pos = siblings.iter().position(|&x| x == i).unwrap();
                siblings
                    .get(pos + 1)
                    .map(|&x| dirs[x].entry_offset)
                    .unwrap_or(INVALID_ENTRY)
            };
            dir_table.extend_from_slice(&dirs[dir.parent].entry_offset.to_le_bytes());
            dir_table.extend_from_slice(&sibling.to_le_bytes());
            dir_table.extend_from_slice(
                &children
                    .first()
                    .map(|&x| dirs[x].entry_offset)
                    .unwrap_or(INVALID_ENTRY)
                    .to_le_bytes(),
            );
            dir_table.extend_from_slice(
                &files_in
                    .first()
                    .map(|&x| file_nodes[x].entry_offset)
                    .unwrap_or(INVALID_ENTRY)
                    .to_le_bytes(),
            );
            dir_table.extend_from_slice(&dir_hash_next[i].to_le_bytes());
            dir_table.extend_from_slice(&(dir.name.len() as u32).to_le_bytes());
            dir_table.extend_from_slice(dir.name.as_bytes());
            while dir_table.len() % 4 != 0 {
                dir_table.push(0);
            }
        }

        let mut file_table = Vec::new();
        for (i, file) in file_nodes.iter().enumerate() {
            let siblings = child_files(file.parent);
            let pos = siblings.iter().position(|&x| x == i).unwrap();
            let sibling = siblings
                .get(pos + 1)
                .map(|&x| file_nodes[x].entry_offset)
                .unwrap_or(INVALID_ENTRY);
            file_table.extend_from_slice(&dirs[file.parent].entry_offset.to_le_bytes());
            file_table.extend_from_slice(&sibling.to_le_bytes());
            file_table.extend_from_slice(&file.data_offset.to_le_bytes());
            file_table.extend_from_slice(&(file.data.len() as u64).to_le_bytes());
            file_table.extend_from_slice(&file_hash_next[i].to_le_bytes());
            file_table.extend_from_slice(&(file.name.len() as u32).to_le_bytes());
            file_table.extend_from_slice(file.name.as_bytes());
            while file_table.len() % 4 != 0 {
                file_table.push(0);
            }
        }

        assert_eq!(dir_table.len() as u64, dir_table_size);
        assert_eq!(file_table.len() as u64, file_table_size);

        // Layout after the header.
        let dir_hash_offset = ROMFS_HEADER_SIZE;
        let dir_table_offset = dir_hash_offset + (dir_bucket_count * 4) as u64;
        let file_hash_offset = dir_table_offset + dir_table_size;
        let file_table_offset = file_hash_offset + (file_bucket_count * 4) as u64;
        let body_offset = crate::io::align_up(file_table_offset + file_table_size, 0x10);

        let header = RomFsHeader {
            header_size: ROMFS_HEADER_SIZE,
            dir_hash_table_offset: dir_hash_offset,
            dir_hash_table_size: (dir_bucket_count * 4) as u64,
            dir_table_offset,
            dir_table_size,
            file_hash_table_offset: file_hash_offset,
            file_hash_table_size: (file_bucket_count * 4) as u64,
            file_table_offset,
            file_table_size,
            file_data_offset: body_offset,
        };

        let mut cursor = binrw::io::Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        let mut image = cursor.into_inner();
        for bucket in &dir_buckets {
            image.extend_from_slice(&bucket.to_le_bytes());
        }
        image.extend_from_slice(&dir_table);
        for bucket in &file_buckets {
            image.extend_from_slice(&bucket.to_le_bytes());
        }
        image.extend_from_slice(&file_table);
        image.resize(body_offset as usize, 0);
        for file in &file_nodes {
            image.extend_from_slice(&file.data);
        }
        image
    }
}
