use core::{fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured when an error value is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors raised while setting up the heap layer.
///
/// Allocation failures are not errors at this layer; they are reported
/// through null (`None`) results.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HeapError {
    #[snafu(display("heap driver failed to initialize: {reason}"))]
    DriverInit {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("a log sink is already installed"))]
    LoggerAlreadySet {
        #[snafu(implicit)]
        location: Location,
    },
}

impl HeapError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::DriverInit { location, .. } | Self::LoggerAlreadySet { location } => *location,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_points_at_builder() {
        let line = line!() + 1;
        let err = DriverInitSnafu { reason: "no zone" }.build();
        assert_eq!(err.location().line(), line);
        assert!(err.location().file().ends_with("error.rs"));
        assert_eq!(
            err.to_string(),
            "heap driver failed to initialize: no zone"
        );
    }
}
