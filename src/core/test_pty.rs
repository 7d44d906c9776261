//! A throwaway pseudo-terminal pair for exercising termios and winsize calls.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::callback::TerminalSize;

pub(crate) struct PseudoTerminal {
    pub(crate) master: OwnedFd,
    pub(crate) slave: OwnedFd,
}

impl PseudoTerminal {
    pub(crate) fn open() -> Self {
        unsafe {
            let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(master >= 0, "posix_openpt failed");
            let master = OwnedFd::from_raw_fd(master);
            assert_eq!(libc::grantpt(master.as_raw_fd()), 0);
            assert_eq!(libc::unlockpt(master.as_raw_fd()), 0);

            let mut name = [0 as libc::c_char; 128];
            assert_eq!(libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()), 0);

            let slave = libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY);
            assert!(slave >= 0, "opening pty slave failed");

            Self {
                master,
                slave: OwnedFd::from_raw_fd(slave),
            }
        }
    }

    pub(crate) fn attributes(&self) -> libc::termios {
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::tcgetattr(self.slave.as_raw_fd(), &mut attrs) }, 0);
        attrs
    }

    pub(crate) fn set_size(&self, size: TerminalSize) {
        let winsize = libc::winsize {
            ws_row: size.rows,
            ws_col: size.columns,
            ws_xpixel: size.width,
            ws_ypixel: size.height,
        };
        assert_eq!(
            unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) },
            0
        );
    }
}

pub(crate) fn same_attributes(a: &libc::termios, b: &libc::termios) -> bool {
    a.c_iflag == b.c_iflag
        && a.c_oflag == b.c_oflag
        && a.c_cflag == b.c_cflag
        && a.c_lflag == b.c_lflag
        && a.c_cc == b.c_cc
}
