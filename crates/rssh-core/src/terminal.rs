//! Terminal mode opcodes carried in `pty-req` payloads.
//!
//! The opcode space is described by a single static table. Adding an opcode
//! means adding a variant and a table row; lookups never branch per opcode.

use std::collections::HashMap;
use std::fmt;

/// Opcode that terminates a terminal mode block. Never a real entry.
pub const TTY_OP_END: u8 = 0;

/// First opcode of the range that stops mode parsing (RFC 4254 §8).
pub const TTY_OP_UNDEFINED_START: u8 = 160;

/// A known terminal mode opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TerminalMode {
    VIntr = 1,
    VQuit = 2,
    VErase = 3,
    VKill = 4,
    VEof = 5,
    VEol = 6,
    VEol2 = 7,
    VStart = 8,
    VStop = 9,
    VSusp = 10,
    VDsusp = 11,
    VReprint = 12,
    VWErase = 13,
    VLNext = 14,
    VFlush = 15,
    VSwtch = 16,
    VStatus = 17,
    VDiscard = 18,
    IgnPar = 30,
    ParMrk = 31,
    InpCk = 32,
    IStrip = 33,
    InlCr = 34,
    IgnCr = 35,
    ICrNl = 36,
    IUclc = 37,
    IXon = 38,
    IXany = 39,
    IXoff = 40,
    IMaxBel = 41,
    IUtf8 = 42,
    ISig = 50,
    ICanon = 51,
    XCase = 52,
    Echo = 53,
    EchoE = 54,
    EchoK = 55,
    EchoNl = 56,
    NoFlsh = 57,
    ToStop = 58,
    IExten = 59,
    EchoCtl = 60,
    EchoKe = 61,
    PendIn = 62,
    OPost = 70,
    OlCuc = 71,
    OnlCr = 72,
    OcrNl = 73,
    OnoCr = 74,
    OnlRet = 75,
    Cs7 = 90,
    Cs8 = 91,
    ParEnb = 92,
    ParOdd = 93,
    InputSpeed = 128,
    OutputSpeed = 129,
}

/// Broad grouping of a mode, following the termios field it controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeClass {
    ControlChar,
    InputFlag,
    LocalFlag,
    OutputFlag,
    ControlFlag,
    Speed,
}

use ModeClass::*;
use TerminalMode::*;

/// `(mode, name, class)` for every defined opcode, ordered by opcode.
static MODE_TABLE: &[(TerminalMode, &str, ModeClass)] = &[
    (VIntr, "VINTR", ControlChar),
    (VQuit, "VQUIT", ControlChar),
    (VErase, "VERASE", ControlChar),
    (VKill, "VKILL", ControlChar),
    (VEof, "VEOF", ControlChar),
    (VEol, "VEOL", ControlChar),
    (VEol2, "VEOL2", ControlChar),
    (VStart, "VSTART", ControlChar),
    (VStop, "VSTOP", ControlChar),
    (VSusp, "VSUSP", ControlChar),
    (VDsusp, "VDSUSP", ControlChar),
    (VReprint, "VREPRINT", ControlChar),
    (VWErase, "VWERASE", ControlChar),
    (VLNext, "VLNEXT", ControlChar),
    (VFlush, "VFLUSH", ControlChar),
    (VSwtch, "VSWTCH", ControlChar),
    (VStatus, "VSTATUS", ControlChar),
    (VDiscard, "VDISCARD", ControlChar),
    (IgnPar, "IGNPAR", InputFlag),
    (ParMrk, "PARMRK", InputFlag),
    (InpCk, "INPCK", InputFlag),
    (IStrip, "ISTRIP", InputFlag),
    (InlCr, "INLCR", InputFlag),
    (IgnCr, "IGNCR", InputFlag),
    (ICrNl, "ICRNL", InputFlag),
    (IUclc, "IUCLC", InputFlag),
    (IXon, "IXON", InputFlag),
    (IXany, "IXANY", InputFlag),
    (IXoff, "IXOFF", InputFlag),
    (IMaxBel, "IMAXBEL", InputFlag),
    (IUtf8, "IUTF8", InputFlag),
    (ISig, "ISIG", LocalFlag),
    (ICanon, "ICANON", LocalFlag),
    (XCase, "XCASE", LocalFlag),
    (Echo, "ECHO", LocalFlag),
    (EchoE, "ECHOE", LocalFlag),
    (EchoK, "ECHOK", LocalFlag),
    (EchoNl, "ECHONL", LocalFlag),
    (NoFlsh, "NOFLSH", LocalFlag),
    (ToStop, "TOSTOP", LocalFlag),
    (IExten, "IEXTEN", LocalFlag),
    (EchoCtl, "ECHOCTL", LocalFlag),
    (EchoKe, "ECHOKE", LocalFlag),
    (PendIn, "PENDIN", LocalFlag),
    (OPost, "OPOST", OutputFlag),
    (OlCuc, "OLCUC", OutputFlag),
    (OnlCr, "ONLCR", OutputFlag),
    (OcrNl, "OCRNL", OutputFlag),
    (OnoCr, "ONOCR", OutputFlag),
    (OnlRet, "ONLRET", OutputFlag),
    (Cs7, "CS7", ControlFlag),
    (Cs8, "CS8", ControlFlag),
    (ParEnb, "PARENB", ControlFlag),
    (ParOdd, "PARODD", ControlFlag),
    (InputSpeed, "TTY_OP_ISPEED", Speed),
    (OutputSpeed, "TTY_OP_OSPEED", Speed),
];

fn lookup(opcode: u8) -> Option<&'static (TerminalMode, &'static str, ModeClass)> {
    MODE_TABLE
        .binary_search_by_key(&opcode, |(mode, _, _)| *mode as u8)
        .ok()
        .map(|idx| &MODE_TABLE[idx])
}

impl TerminalMode {
    /// Every defined mode, in opcode order.
    pub fn all() -> impl Iterator<Item = TerminalMode> {
        MODE_TABLE.iter().map(|(mode, _, _)| *mode)
    }

    /// Map a wire opcode to a mode. `None` for the terminator and undefined opcodes.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        lookup(opcode).map(|(mode, _, _)| *mode)
    }

    /// Map a mode name (e.g. `"ECHO"`, case-insensitive) to a mode.
    pub fn from_name(name: &str) -> Option<Self> {
        MODE_TABLE
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(mode, _, _)| *mode)
    }

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        lookup(self as u8).map(|(_, name, _)| *name).unwrap_or("UNKNOWN")
    }

    pub fn class(self) -> ModeClass {
        lookup(self as u8)
            .map(|(_, _, class)| *class)
            .unwrap_or(ControlChar)
    }
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded terminal modes: opcode → value. Unordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalModes(HashMap<TerminalMode, u32>);

impl TerminalModes {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, mode: TerminalMode, value: u32) -> Option<u32> {
        self.0.insert(mode, value)
    }

    pub fn get(&self, mode: TerminalMode) -> Option<u32> {
        self.0.get(&mode).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TerminalMode, u32)> + '_ {
        self.0.iter().map(|(mode, value)| (*mode, *value))
    }
}

impl FromIterator<(TerminalMode, u32)> for TerminalModes {
    fn from_iter<I: IntoIterator<Item = (TerminalMode, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TerminalModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort();
        for (i, (mode, value)) in entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{mode}={value}")?;
        }
        Ok(())
    }
}
