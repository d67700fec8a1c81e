//! Loop devices backing overlay images.
//!
//! An image file is attached to a free `/dev/loopN` with autoclear set, so
//! the kernel releases the device once its last mount is gone even if the
//! engine dies. [`LoopDevice`] also detaches explicitly when dropped.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use strata_common::error::{EngineError, Result};

use crate::privilege::SetupPrivilege;

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn new(backing: &Path, flags: u32) -> Self {
        let mut file_name = [0_u8; LO_NAME_SIZE];
        let bytes = backing.as_os_str().as_encoded_bytes();
        let len = bytes.len().min(LO_NAME_SIZE - 1);
        file_name[..len].copy_from_slice(&bytes[..len]);
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: flags,
            lo_file_name: file_name,
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// A loop device attached to an image file for this invocation.
#[derive(Debug)]
pub struct LoopDevice {
    path: PathBuf,
    device: Option<File>,
}

impl LoopDevice {
    /// Attaches `image` to a free loop device.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LoopAttach`] if no device is free or any
    /// ioctl fails.
    pub fn attach(_privilege: &SetupPrivilege, image: &Path, read_only: bool) -> Result<Self> {
        let fail = |reason: String| EngineError::LoopAttach {
            path: image.to_path_buf(),
            reason,
        };

        let backing = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(image)
            .map_err(|e| fail(format!("cannot open image: {e}")))?;

        let control = File::open(LOOP_CONTROL)
            .map_err(|e| fail(format!("cannot open {LOOP_CONTROL}: {e}")))?;
        // SAFETY: LOOP_CTL_GET_FREE takes no argument and `control` is an
        // open descriptor for the loop control device.
        let number = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if number < 0 {
            return Err(fail(format!(
                "no free loop device: {}",
                std::io::Error::last_os_error()
            )));
        }

        let path = PathBuf::from(format!("/dev/loop{number}"));
        let device = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| fail(format!("cannot open {}: {e}", path.display())))?;

        // SAFETY: both descriptors are open and owned by this function;
        // LOOP_SET_FD takes the backing descriptor by value.
        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                LOOP_SET_FD as _,
                backing.as_raw_fd() as libc::c_ulong,
            )
        };
        if rc < 0 {
            return Err(fail(format!(
                "LOOP_SET_FD on {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        let mut loop_device = Self {
            path,
            device: Some(device),
        };
        let mut flags = LO_FLAGS_AUTOCLEAR;
        if read_only {
            flags |= LO_FLAGS_READ_ONLY;
        }
        let info = LoopInfo64::new(image, flags);
        let fd = loop_device.raw_fd();
        // SAFETY: `info` is a properly laid out `loop_info64` that outlives
        // the call; the kernel only reads from it.
        let rc = unsafe { libc::ioctl(fd, LOOP_SET_STATUS64 as _, &raw const info) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            loop_device.detach();
            return Err(fail(format!("LOOP_SET_STATUS64: {err}")));
        }

        tracing::info!(
            image = %image.display(),
            device = %loop_device.path.display(),
            read_only,
            "image attached to loop device"
        );
        Ok(loop_device)
    }

    /// Device node path, e.g. `/dev/loop3`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw_fd(&self) -> i32 {
        self.device.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Detaches the backing file. Safe to call more than once.
    pub fn detach(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        // SAFETY: `device` is an open loop device descriptor; LOOP_CLR_FD
        // takes no argument.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // ENXIO: already cleared by autoclear.
            if err.raw_os_error() != Some(libc::ENXIO) {
                tracing::warn!(device = %self.path.display(), error = %err, "loop detach failed");
            }
            return;
        }
        tracing::debug!(device = %self.path.display(), "loop device detached");
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        self.detach();
    }
}
