use heap::{Location, ResultCode};
use snafu::Snafu;

/// Failure of a connection-scoped allocation.
///
/// Every variant folds into [`ResultCode::NoMem`] at the API boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AllocError {
    #[snafu(display("out of memory allocating {requested} bytes"))]
    OutOfMemory {
        requested: i64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation size {requested} is out of range"))]
    SizeLimit {
        requested: i64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation refused after an earlier failure"))]
    Latched {
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns `true` if the request was refused because the connection
    /// had already failed, without consulting any allocator.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        matches!(self, Self::Latched { .. })
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::SizeLimit { location, .. }
            | Self::Latched { location } => *location,
        }
    }
}

impl From<AllocError> for ResultCode {
    fn from(_: AllocError) -> Self {
        Self::NoMem
    }
}
