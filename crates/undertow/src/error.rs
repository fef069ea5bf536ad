/// Whether an error is a broken invariant or a caller mistake.
///
/// Internal errors are fatal: some data structure is no longer trustworthy
/// and the embedder should surface the error, not retry. Input errors are
/// recoverable rejections of a caller-supplied value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Internal,
    Input,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("piece {0} is already delegated")]
    DuplicatePieceIndex(u32),
    #[error("piece {0} is not in the transfer list")]
    PieceNotFound(u32),
    #[error("hash verdict for piece {0} arrived before all blocks finished")]
    VerdictBeforeAssembly(u32),
    #[error("transfer does not match any registered block attempt")]
    InvalidTransfer,
    #[error("no stored payload variant for a block of piece {0}")]
    MissingVariant(u32),

    #[error("choke group name empty or already taken: {0:?}")]
    BadGroupName(String),
    #[error("choke group {0} does not exist")]
    GroupNotFound(usize),
    #[error("download is not registered with the resource manager")]
    DownloadNotFound,
    #[error("priority {0} out of range")]
    PriorityOutOfRange(u32),
    #[error("max unchoked {0} out of range")]
    MaxUnchokedOutOfRange(u32),
    #[error("unchoke count would go negative (currently {currently}, adjust {adjust})")]
    UnchokeWentNegative { currently: u32, adjust: i32 },
    #[error("choke group boundaries do not match the entry vector")]
    GroupBoundariesBroken,
    #[error("unchoke balancing did not consume all group weight")]
    WeightNotConsumed,
    #[error(
        "unchoke totals out of sync with queues (up {up_total} vs {up_sum}, down {down_total} vs {down_sum})"
    )]
    UnchokeTotalsMismatch {
        up_total: u32,
        up_sum: u32,
        down_total: u32,
        down_sum: u32,
    },

    #[error("shut down with pieces still in flight")]
    ShutdownNonEmpty,
    #[error("shut down with peers still unchoked")]
    ShutdownUnchoked,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadGroupName(_)
            | Error::GroupNotFound(_)
            | Error::DownloadNotFound
            | Error::PriorityOutOfRange(_)
            | Error::MaxUnchokedOutOfRange(_) => ErrorKind::Input,
            _ => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::GroupNotFound(3).kind(), ErrorKind::Input);
        assert_eq!(Error::DuplicatePieceIndex(0).kind(), ErrorKind::Internal);
        assert_eq!(
            Error::UnchokeWentNegative {
                currently: 0,
                adjust: -1
            }
            .kind(),
            ErrorKind::Internal
        );
    }
}
