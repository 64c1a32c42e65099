use skansen_engine::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("tick {tick}: {interface}: {detail}")]
    InvariantViolated {
        tick: u64,
        interface: String,
        detail: String,
    },
    #[error("{interface} did not converge once faults stopped: {source}")]
    NotConverged {
        interface: String,
        #[source]
        source: SyncError,
    },
}
