//! Terminal line-discipline settings for Unix spawns.
//!
//! The pty is created with a fixed set of modes: canonical input with echo,
//! signal keys, XON/XOFF flow control, 8-bit characters and NL→CR-NL output
//! translation. Flag bits and control character slots are ABI constants of
//! each OS's terminal driver, so each target gets its own table. The tables
//! are plain data and compile everywhere; only [`TermiosProfile::to_native`]
//! touches `libc`.

use bitflags::bitflags;

/// Number of control character slots on Linux.
pub const LINUX_NCCS: usize = 32;
/// Number of control character slots on macOS.
pub const MACOS_NCCS: usize = 20;

/// Value that disables a control character.
pub const DISABLED: u8 = 0xff;

pub mod linux {
    use bitflags::bitflags;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct InputFlags: u64 {
            const BRKINT = 0x2;
            const ICRNL = 0x100;
            const IXON = 0x400;
            const IXANY = 0x800;
            const IMAXBEL = 0x2000;
            const IUTF8 = 0x4000;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct OutputFlags: u64 {
            const OPOST = 0x1;
            const ONLCR = 0x4;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ControlFlags: u64 {
            const CS8 = 0x30;
            const CREAD = 0x80;
            const HUPCL = 0x400;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct LocalFlags: u64 {
            const ISIG = 0x1;
            const ICANON = 0x2;
            const ECHO = 0x8;
            const ECHOE = 0x10;
            const ECHOK = 0x20;
            const ECHOCTL = 0x200;
            const ECHOKE = 0x800;
            const IEXTEN = 0x8000;
        }
    }

    pub const B38400: u64 = 0o17;

    pub const VINTR: usize = 0;
    pub const VQUIT: usize = 1;
    pub const VERASE: usize = 2;
    pub const VKILL: usize = 3;
    pub const VEOF: usize = 4;
    pub const VTIME: usize = 5;
    pub const VMIN: usize = 6;
    pub const VSTART: usize = 8;
    pub const VSTOP: usize = 9;
    pub const VSUSP: usize = 10;
    pub const VEOL: usize = 11;
    pub const VREPRINT: usize = 12;
    pub const VDISCARD: usize = 13;
    pub const VWERASE: usize = 14;
    pub const VLNEXT: usize = 15;
    pub const VEOL2: usize = 16;

    pub const TIOCSWINSZ: u64 = 0x5414;
    pub const TIOCSIG: u64 = 0x4004_5436;
}

pub mod macos {
    use bitflags::bitflags;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct InputFlags: u64 {
            const BRKINT = 0x2;
            const ICRNL = 0x100;
            const IXON = 0x200;
            const IXANY = 0x800;
            const IMAXBEL = 0x2000;
            const IUTF8 = 0x4000;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct OutputFlags: u64 {
            const OPOST = 0x1;
            const ONLCR = 0x2;
            const OCRNL = 0x10;
            const ONLRET = 0x40;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ControlFlags: u64 {
            const CS8 = 0x300;
            const CREAD = 0x800;
            const HUPCL = 0x4000;
        }
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct LocalFlags: u64 {
            const ECHOKE = 0x1;
            const ECHOE = 0x2;
            const ECHOK = 0x4;
            const ECHO = 0x8;
            const ECHOCTL = 0x40;
            const ISIG = 0x80;
            const ICANON = 0x100;
            const IEXTEN = 0x400;
        }
    }

    pub const B38400: u64 = 38400;

    pub const VEOF: usize = 0;
    pub const VEOL: usize = 1;
    pub const VEOL2: usize = 2;
    pub const VERASE: usize = 3;
    pub const VWERASE: usize = 4;
    pub const VKILL: usize = 5;
    pub const VREPRINT: usize = 6;
    pub const VINTR: usize = 8;
    pub const VQUIT: usize = 9;
    pub const VSUSP: usize = 10;
    pub const VDSUSP: usize = 11;
    pub const VSTART: usize = 12;
    pub const VSTOP: usize = 13;
    pub const VLNEXT: usize = 14;
    pub const VDISCARD: usize = 15;
    pub const VMIN: usize = 16;
    pub const VTIME: usize = 17;
    pub const VSTATUS: usize = 18;

    pub const TIOCSWINSZ: u64 = 0x8008_7467;
    pub const TIOCSIG: u64 = 0x2000_745f;
}

/// Which terminal driver ABI to build settings for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAbi {
    Linux,
    MacOs,
}

/// How a hang-up is delivered to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupMethod {
    /// `kill(pid, SIGHUP)`.
    SignalProcess,
    /// `ioctl(controller, TIOCSIG, SIGHUP)`, raised by the driver.
    ControllerIoctl,
}

/// Resolved terminal settings for one ABI, as raw numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermiosProfile {
    pub input: u64,
    pub output: u64,
    pub control: u64,
    pub local: u64,
    pub speed: u64,
    pub cc: Vec<u8>,
}

impl TerminalAbi {
    /// ABI of the host, if it has one we support.
    pub fn host() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(TerminalAbi::Linux)
        } else if cfg!(target_os = "macos") {
            Some(TerminalAbi::MacOs)
        } else {
            None
        }
    }

    pub fn nccs(self) -> usize {
        match self {
            TerminalAbi::Linux => LINUX_NCCS,
            TerminalAbi::MacOs => MACOS_NCCS,
        }
    }

    pub fn set_window_size_request(self) -> u64 {
        match self {
            TerminalAbi::Linux => linux::TIOCSWINSZ,
            TerminalAbi::MacOs => macos::TIOCSWINSZ,
        }
    }

    pub fn signal_request(self) -> u64 {
        match self {
            TerminalAbi::Linux => linux::TIOCSIG,
            TerminalAbi::MacOs => macos::TIOCSIG,
        }
    }

    pub fn hangup_method(self) -> HangupMethod {
        match self {
            TerminalAbi::Linux => HangupMethod::SignalProcess,
            TerminalAbi::MacOs => HangupMethod::ControllerIoctl,
        }
    }

    /// Settings the pty is created with.
    pub fn profile(self) -> TermiosProfile {
        match self {
            TerminalAbi::Linux => linux_profile(),
            TerminalAbi::MacOs => macos_profile(),
        }
    }
}

fn linux_profile() -> TermiosProfile {
    use linux::*;

    let mut cc = vec![0u8; LINUX_NCCS];
    for (slot, value) in [
        (VEOF, 4),
        (VEOL, DISABLED),
        (VEOL2, DISABLED),
        (VERASE, 0x7f),
        (VWERASE, 23),
        (VKILL, 21),
        (VREPRINT, 18),
        (VINTR, 3),
        (VQUIT, 28),
        (VSUSP, 26),
        (VSTART, 17),
        (VSTOP, 19),
        (VLNEXT, 22),
        (VDISCARD, 15),
        (VMIN, 1),
        (VTIME, 0),
    ] {
        cc[slot] = value;
    }

    TermiosProfile {
        input: (InputFlags::BRKINT
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXANY
            | InputFlags::IMAXBEL
            | InputFlags::IUTF8)
            .bits(),
        output: (OutputFlags::OPOST | OutputFlags::ONLCR).bits(),
        control: (ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::HUPCL).bits(),
        local: (LocalFlags::ECHOKE
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ECHO
            | LocalFlags::ECHOCTL
            | LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::IEXTEN)
            .bits(),
        speed: B38400,
        cc,
    }
}

fn macos_profile() -> TermiosProfile {
    use macos::*;

    let mut cc = vec![0u8; MACOS_NCCS];
    for (slot, value) in [
        (VEOF, 4),
        (VEOL, DISABLED),
        (VEOL2, DISABLED),
        (VERASE, 0x7f),
        (VWERASE, 23),
        (VKILL, 21),
        (VREPRINT, 18),
        (VINTR, 3),
        (VQUIT, 28),
        (VSUSP, 26),
        (VSTART, 17),
        (VSTOP, 19),
        (VLNEXT, 22),
        (VDISCARD, 15),
        (VMIN, 1),
        (VTIME, 0),
        (VDSUSP, 25),
        (VSTATUS, 20),
    ] {
        cc[slot] = value;
    }

    TermiosProfile {
        input: (InputFlags::BRKINT
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXANY
            | InputFlags::IMAXBEL
            | InputFlags::IUTF8)
            .bits(),
        output: (OutputFlags::OPOST | OutputFlags::ONLCR).bits(),
        control: (ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::HUPCL).bits(),
        local: (LocalFlags::ECHOKE
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ECHO
            | LocalFlags::ECHOCTL
            | LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::IEXTEN)
            .bits(),
        speed: B38400,
        cc,
    }
}

#[cfg(unix)]
impl TermiosProfile {
    /// Native `termios` for the host. The profile must be for the host ABI.
    pub fn to_native(&self) -> nix::libc::termios {
        use nix::libc;

        // SAFETY: termios is a plain C struct; all-zero is a valid value.
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        termios.c_iflag = self.input as libc::tcflag_t;
        termios.c_oflag = self.output as libc::tcflag_t;
        termios.c_cflag = self.control as libc::tcflag_t;
        termios.c_lflag = self.local as libc::tcflag_t;
        for (slot, value) in termios.c_cc.iter_mut().zip(self.cc.iter()) {
            *slot = *value as libc::cc_t;
        }
        // SAFETY: termios is a valid, initialized struct and the speed is a
        // known baud constant. cfset*speed only fails on unknown speeds.
        unsafe {
            libc::cfsetispeed(&mut termios, self.speed as libc::speed_t);
            libc::cfsetospeed(&mut termios, self.speed as libc::speed_t);
        }
        termios
    }
}
