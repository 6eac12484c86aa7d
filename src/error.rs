use thiserror::Error;

/// Error taxonomy of the measurement-acquisition core.
///
/// Fatal kinds (`SetupFailure`, `ProtocolDesync`, `UnsupportedMetric`) abort
/// the run or the current collection call. `ContextNotFound` is recovered
/// locally by skipping the affected record. `StaleRequestBacklog` rejects the
/// offending request and leaves the queue intact.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no monitored process could be reached: {0}")]
    SetupFailure(String),

    #[error("protocol desync on rank {rank}: {detail}")]
    ProtocolDesync { rank: u64, detail: String },

    #[error("metric {0} is not supported by the measurement runtime")]
    UnsupportedMetric(&'static str),

    #[error("no measurement context found for {0}")]
    ContextNotFound(String),

    #[error(
        "old requests are still pending; re-run the current experiment \
         without new measurement requests"
    )]
    StaleRequestBacklog,

    #[error("invalid query window [{left},{right}), last written iteration is {last_written}")]
    InvalidWindow {
        left: u32,
        right: u32,
        last_written: u32,
    },

    #[error("blocking wait cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
