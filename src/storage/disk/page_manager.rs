use crate::storage::error::StorageResult;
use crate::storage::page::{FileId, PageId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const PAGE_SIZE: usize = 8192;

/// Reads and writes whole pages of the data files under one directory.
///
/// Each file id maps to `file_<id>.dat`. Pages that were never written read
/// back as zeroes.
pub struct PageManager {
    dir: PathBuf,
    files: HashMap<FileId, File>,
    fsync: bool,
}

impl PageManager {
    pub fn open(dir: &Path, fsync: bool) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: HashMap::new(),
            fsync,
        })
    }

    pub fn file_path(&self, file_id: FileId) -> PathBuf {
        self.dir.join(format!("file_{}.dat", file_id.0))
    }

    fn existing_file(&mut self, file_id: FileId) -> StorageResult<Option<&mut File>> {
        let path = self.file_path(file_id);
        match self.files.entry(file_id) {
            Entry::Occupied(entry) => Ok(Some(entry.into_mut())),
            Entry::Vacant(_) if !path.exists() => Ok(None),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok(Some(entry.insert(file)))
            }
        }
    }

    fn file_for_write(&mut self, file_id: FileId) -> StorageResult<&mut File> {
        let path = self.file_path(file_id);
        match self.files.entry(file_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                Ok(entry.insert(file))
            }
        }
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let file = match self.existing_file(page_id.file_id)? {
            Some(file) => file,
            None => {
                buf.fill(0);
                return Ok(());
            }
        };

        if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = Self::page_offset(page_id);
        let fsync = self.fsync;
        let file = self.file_for_write(page_id.file_id)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn num_pages(&mut self, file_id: FileId) -> StorageResult<u32> {
        match self.existing_file(file_id)? {
            Some(file) => Ok((file.metadata()?.len() / PAGE_SIZE as u64) as u32),
            None => Ok(0),
        }
    }

    pub fn sync_all(&mut self) -> StorageResult<()> {
        for file in self.files.values() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.page_index as u64 * PAGE_SIZE as u64
    }
}
