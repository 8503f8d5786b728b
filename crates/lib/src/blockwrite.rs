//! Raw image writes onto partitions.

use std::fs::File;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Fixed transfer size for raw copies.
const BLOCK_SIZE: usize = 1024 * 1024;

/// A raw block write that did not run to completion. Fatal; the caller
/// never retries.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("opening image {path}")]
    OpenImage {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading image {path}")]
    ReadImage {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening target device {device}")]
    OpenDevice {
        device: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing to {device} after {written} bytes")]
    Write {
        device: Utf8PathBuf,
        written: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("flushing {device}")]
    Flush {
        device: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copy the full byte content of `image` onto `device` in [`BLOCK_SIZE`]
/// chunks, overwriting whatever is there, then fsync the device before
/// returning. Returns the number of bytes written.
pub(crate) fn write_image(image: &Utf8Path, device: &Utf8Path) -> Result<u64, WriteError> {
    let mut src = File::open(image).map_err(|source| WriteError::OpenImage {
        path: image.to_owned(),
        source,
    })?;
    let mut dst = std::fs::OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|source| WriteError::OpenDevice {
            device: device.to_owned(),
            source,
        })?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut written: u64 = 0;
    loop {
        let n = src.read(&mut buf).map_err(|source| WriteError::ReadImage {
            path: image.to_owned(),
            source,
        })?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .map_err(|source| WriteError::Write {
                device: device.to_owned(),
                written,
                source,
            })?;
        written += n as u64;
    }
    // Durability barrier: the write is not committed until it has hit
    // stable storage.
    dst.sync_all().map_err(|source| WriteError::Flush {
        device: device.to_owned(),
        source,
    })?;
    tracing::debug!("wrote {written} bytes from {image} to {device}");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn utf8(p: &Path) -> &Utf8Path {
        Utf8Path::from_path(p).unwrap()
    }

    #[test]
    fn test_write_image_copies_bytes() {
        let td = tempfile::tempdir().unwrap();
        let image = td.path().join("rootfs.img");
        let device = td.path().join("part");
        let payload: Vec<u8> = (0u32..8192).flat_map(|i| i.to_le_bytes()).collect();
        std::fs::write(&image, &payload).unwrap();
        std::fs::write(&device, b"").unwrap();

        let n = write_image(utf8(&image), utf8(&device)).unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(std::fs::read(&device).unwrap(), payload);
    }

    #[test]
    fn test_write_image_overwrites_without_truncating() {
        // A block device has a fixed size; writing a shorter image must
        // replace the leading bytes and leave the remainder alone.
        let td = tempfile::tempdir().unwrap();
        let image = td.path().join("rootfs.img");
        let device = td.path().join("part");
        std::fs::write(&image, b"new!").unwrap();
        std::fs::write(&device, b"0123456789").unwrap();

        let n = write_image(utf8(&image), utf8(&device)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(std::fs::read(&device).unwrap(), b"new!456789");
    }

    #[test]
    fn test_write_image_missing_source() {
        let td = tempfile::tempdir().unwrap();
        let image = td.path().join("no-such-image");
        let device = td.path().join("part");
        std::fs::write(&device, b"untouched").unwrap();

        let e = write_image(utf8(&image), utf8(&device)).unwrap_err();
        assert!(matches!(e, WriteError::OpenImage { .. }), "{e}");
        // The failed open happened before any write
        assert_eq!(std::fs::read(&device).unwrap(), b"untouched");
    }

    #[test]
    fn test_write_image_missing_device() {
        let td = tempfile::tempdir().unwrap();
        let image = td.path().join("rootfs.img");
        std::fs::write(&image, b"payload").unwrap();
        let device = td.path().join("no-such-device");

        let e = write_image(utf8(&image), utf8(&device)).unwrap_err();
        assert!(matches!(e, WriteError::OpenDevice { .. }), "{e}");
    }
}
