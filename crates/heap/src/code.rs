//! Result codes reported at the public API boundary.

use core::fmt;

/// Outcome of a public operation, as seen by the caller of the engine.
///
/// Only the codes the allocation layers produce or inspect are modelled
/// here. [`ResultCode::IoErrNoMem`] is the extended form of
/// [`ResultCode::IoErr`] that a storage layer reports when it ran out of
/// memory while doing I/O; the API checkpoint folds it into
/// [`ResultCode::NoMem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Error,
    Busy,
    NoMem,
    IoErr,
    TooBig,
    Misuse,
    IoErrNoMem,
}

impl ResultCode {
    const IOERR_NOMEM: i32 = 10 | (12 << 8);

    /// Returns the numeric value of this code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::Busy => 5,
            Self::NoMem => 7,
            Self::IoErr => 10,
            Self::TooBig => 18,
            Self::Misuse => 21,
            Self::IoErrNoMem => Self::IOERR_NOMEM,
        }
    }

    /// Looks up the code with the given numeric value.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        let rc = match code {
            0 => Self::Ok,
            1 => Self::Error,
            5 => Self::Busy,
            7 => Self::NoMem,
            10 => Self::IoErr,
            18 => Self::TooBig,
            21 => Self::Misuse,
            Self::IOERR_NOMEM => Self::IoErrNoMem,
            _ => return None,
        };
        Some(rc)
    }

    /// Strips the extended part of the code.
    #[must_use]
    pub const fn primary(self) -> Self {
        match self {
            Self::IoErrNoMem => Self::IoErr,
            rc => rc,
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns `true` if the code denotes an out-of-memory condition in any
    /// layer.
    #[must_use]
    pub const fn is_nomem(self) -> bool {
        matches!(self, Self::NoMem | Self::IoErrNoMem)
    }

    /// Returns the English description of the code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "not an error",
            Self::Error => "SQL logic error",
            Self::Busy => "database is locked",
            Self::NoMem => "out of memory",
            Self::IoErr | Self::IoErrNoMem => "disk I/O error",
            Self::TooBig => "string or blob too big",
            Self::Misuse => "bad parameter or other API misuse",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ResultCode; 8] = [
        ResultCode::Ok,
        ResultCode::Error,
        ResultCode::Busy,
        ResultCode::NoMem,
        ResultCode::IoErr,
        ResultCode::TooBig,
        ResultCode::Misuse,
        ResultCode::IoErrNoMem,
    ];

    #[test]
    fn test_from_code_matches_code() {
        for rc in ALL {
            assert_eq!(ResultCode::from_code(rc.code()), Some(rc));
        }
        assert_eq!(ResultCode::from_code(-1), None);
        assert_eq!(ResultCode::from_code(3), None);
    }

    #[test]
    fn test_extended_nomem() {
        assert_eq!(ResultCode::IoErrNoMem.code(), 3082);
        assert_eq!(ResultCode::IoErrNoMem.primary(), ResultCode::IoErr);
        assert_eq!(ResultCode::NoMem.primary(), ResultCode::NoMem);
    }

    #[test]
    fn test_is_nomem() {
        let nomem = ALL.iter().filter(|rc| rc.is_nomem()).collect::<Vec<_>>();
        assert_eq!(nomem, [&ResultCode::NoMem, &ResultCode::IoErrNoMem]);
        assert!(ResultCode::Ok.is_ok());
        assert!(!ResultCode::Error.is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(ResultCode::NoMem.to_string(), "out of memory");
        assert_eq!(ResultCode::Ok.to_string(), "not an error");
        assert_eq!(ResultCode::Busy.to_string(), "database is locked");
    }
}
