//! `/dev/net/tun` device creation.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Create a TUN device from `name_pattern` (`%d` lets the kernel pick).
///
/// Returns the close-on-exec descriptor and the assigned name. The device
/// is not persistent: it disappears when the last descriptor is closed.
pub(super) fn open_tun(name_pattern: &str, blocking: bool) -> std::io::Result<(OwnedFd, String)> {
    if name_pattern.is_empty() || name_pattern.len() >= libc::IFNAMSIZ {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid interface name {:?}", name_pattern),
        ));
    }

    let mut flags = libc::O_CLOEXEC;
    if !blocking {
        flags |= libc::O_NONBLOCK;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(flags)
        .open(TUN_DEVICE)?;

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (dst, src) in req.name.iter_mut().zip(name_pattern.bytes()) {
        *dst = src as libc::c_char;
    }

    // SAFETY: req is a properly sized ifreq and outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let name: String = req
        .name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect();

    Ok((OwnedFd::from(file), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn test_rejects_overlong_name() {
        let err = open_tun("a-very-long-interface-name%d", true).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
