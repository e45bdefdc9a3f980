use std::io;

/// `_IO('U', 20)` from linux/usbdevice_fs.h
#[cfg(target_os = "linux")]
const USBDEVFS_RESET: u64 = 0x5514;

/// Resets the dongle behind a usbfs node such as `/dev/bus/usb/001/004`.
/// Helps when a previous rtl_tcp left the device claimed.
#[cfg(target_os = "linux")]
pub fn reset_device(path: &str) -> io::Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new().write(true).open(path)?;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), USBDEVFS_RESET as _, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    return Ok(());
}

#[cfg(not(target_os = "linux"))]
pub fn reset_device(path: &str) -> io::Result<()> {
    return Err(io::Error::new(io::ErrorKind::Unsupported, format!("USB reset of {path} needs usbfs")));
}
