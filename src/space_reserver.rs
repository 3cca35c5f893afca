//! Preallocates disk space for a cache's data file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::block_map::BlockMap;
use crate::error::{Component, Error};

const ZERO_FILL_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Creates (or truncates) the file at `path` and reserves `size` bytes of
/// backing storage for it, using whatever platform primitive is available
/// and falling back to a concurrent zero-fill when none is, exactly the
/// `posix_fallocate`-then-`set_len` split this crate's storage layer has
/// always used, extended with a Windows backend and a fallback that can
/// actually make progress when fallocate-style calls aren't available.
pub async fn reserve(
    path: &Path,
    size: u64,
    concurrency: usize,
    progress: Option<mpsc::Sender<u64>>,
) -> Result<(), Error> {
    let path = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || -> Result<File, Error> {
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::internal(Component::Cache, e))
    })
    .await
    .map_err(|e| Error::internal(Component::Cache, e))??;

    let file = Arc::new(file);

    let allocated = {
        let file = file.clone();
        tokio::task::spawn_blocking(move || platform::allocate(&file, size))
            .await
            .map_err(|e| Error::internal(Component::Cache, e))?
    };

    if !allocated {
        zero_fill(file.clone(), size, concurrency, progress).await?;
    }

    let ok = {
        let file = file.clone();
        tokio::task::spawn_blocking(move || platform::is_allocated(&file, size))
            .await
            .map_err(|e| Error::internal(Component::Cache, e))?
    };

    if !ok {
        return Err(Error::NotEnoughSpace {
            requested: size,
            available: platform::available_space(&file),
        });
    }

    Ok(())
}

async fn zero_fill(
    file: Arc<File>,
    size: u64,
    concurrency: usize,
    progress: Option<mpsc::Sender<u64>>,
) -> Result<(), Error> {
    let concurrency = concurrency.max(1);
    let map = BlockMap::new(size, ZERO_FILL_BLOCK_SIZE).map_err(|e| Error::internal(Component::Cache, e))?;
    let total_blocks = map.num_blocks();
    if total_blocks == 0 {
        return Ok(());
    }

    let mut handles = Vec::with_capacity(concurrency);
    for worker in 0..concurrency {
        let file = file.clone();
        let map = map.clone();
        let progress = progress.clone();
        handles.push(tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let zeros = vec![0u8; ZERO_FILL_BLOCK_SIZE as usize];
            let mut idx = worker;
            while idx < total_blocks {
                if let Some(range) = map.block_range(idx) {
                    let len = range.len() as usize;
                    platform::write_at(&file, range.from, &zeros[..len])
                        .map_err(|e| Error::internal(Component::Cache, e))?;
                    if let Some(tx) = &progress {
                        let _ = tx.try_send(len as u64);
                    }
                }
                idx += concurrency;
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| Error::internal(Component::Cache, e))??;
    }

    Ok(())
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::AsRawFd;

    pub fn allocate(file: &File, size: u64) -> bool {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return true;
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        file.set_len(size).is_ok()
    }

    pub fn is_allocated(file: &File, size: u64) -> bool {
        file.metadata().map(|m| m.len() >= size).unwrap_or(false)
    }

    pub fn available_space(_file: &File) -> Option<u64> {
        None
    }

    pub fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let n = file.write_at(data, offset)?;
        if n != data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: {n} of {}", data.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Storage::FileSystem::{
        SetFileInformationByHandle, FileAllocationInfo, FILE_ALLOCATION_INFO,
    };

    pub fn allocate(file: &File, size: u64) -> bool {
        let info = FILE_ALLOCATION_INFO {
            AllocationSize: size as i64,
        };
        let ok = unsafe {
            SetFileInformationByHandle(
                file.as_raw_handle() as _,
                FileAllocationInfo,
                &info as *const _ as *const _,
                std::mem::size_of::<FILE_ALLOCATION_INFO>() as u32,
            )
        };
        if ok != 0 {
            return true;
        }
        tracing::debug!("SetFileInformationByHandle failed, falling back to set_len");
        file.set_len(size).is_ok()
    }

    pub fn is_allocated(file: &File, size: u64) -> bool {
        file.metadata().map(|m| m.len() >= size).unwrap_or(false)
    }

    pub fn available_space(_file: &File) -> Option<u64> {
        None
    }

    pub fn write_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut f = file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }
}
