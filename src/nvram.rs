//! Persistent byte-addressable backing store for the NVRAM opcodes.
//!
//! The store is a flat 65536-byte file, zero-filled on first creation and
//! opened lazily on the first LOAD_NVRAM/STORE_NVRAM the program executes.
//! The handle stays open for the rest of the run; the interpreter releases
//! it on every termination path, and the Drop impl flushes as a backstop.
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Fixed size of the backing store: one byte per 16-bit address.
pub const NVRAM_SIZE: u64 = 65536;

/// An open NVRAM handle.
pub struct Nvram {
    file: File,
    path: PathBuf,
}

impl Nvram {
    /// Open the backing store at `path`, creating and zero-filling it if it
    /// does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Nvram, String> {
        let path = path.as_ref();
        if !path.exists() {
            info!("creating NVRAM backing store at {}", path.display());
            let file = File::create(path)
                .map_err(|e| format!("Cannot create NVRAM file {}: {}", path.display(), e))?;
            file.set_len(NVRAM_SIZE)
                .map_err(|e| format!("Cannot size NVRAM file {}: {}", path.display(), e))?;
            file.sync_all()
                .map_err(|e| format!("Cannot flush NVRAM file {}: {}", path.display(), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| format!("Cannot open NVRAM file {}: {}", path.display(), e))?;
        Ok(Nvram {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Read one byte at an absolute address.
    pub fn read_byte(&mut self, address: u16) -> Result<u8, String> {
        self.file
            .seek(SeekFrom::Start(u64::from(address)))
            .map_err(|e| format!("NVRAM seek to {} failed: {}", address, e))?;
        let mut buf = [0u8; 1];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| format!("NVRAM read at {} failed: {}", address, e))?;
        Ok(buf[0])
    }

    /// Write one byte at an absolute address.
    pub fn write_byte(&mut self, address: u16, value: u8) -> Result<(), String> {
        self.file
            .seek(SeekFrom::Start(u64::from(address)))
            .map_err(|e| format!("NVRAM seek to {} failed: {}", address, e))?;
        self.file
            .write_all(&[value])
            .map_err(|e| format!("NVRAM write at {} failed: {}", address, e))?;
        Ok(())
    }

    /// Flush and consume the handle.
    pub fn close(mut self) -> Result<(), String> {
        self.file
            .flush()
            .map_err(|e| format!("NVRAM flush of {} failed: {}", self.path.display(), e))
    }
}

impl Drop for Nvram {
    fn drop(&mut self) {
        if let Err(e) = self.file.flush() {
            debug!("NVRAM flush on drop failed: {}", e);
        }
    }
}
