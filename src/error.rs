use thiserror::Error;

use crate::traffic::TrafficError;

/// Errors that abort the operation they occur in.
///
/// Fleet-operational failures (no reachable station, a station going offline
/// mid-trip, battery depletion) are deliberately *not* errors; they are
/// recovered through retries and redirects and only surface as telemetry.
/// Capacity exhaustion is a plain boolean on `add_veh`.
#[derive(Debug, Error)]
pub enum SimError {
    /// Malformed curve, window or scenario definitions. Fatal at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An unknown vehicle, station or strategy name was referenced.
    #[error("{0} not found")]
    NotFound(String),

    /// The engine and the core disagree on a vehicle's status.
    #[error("vehicle state desynchronized: {0}")]
    VehicleState(String),

    /// An allocation strategy returned a wrong-sized result.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A transport-level failure of the traffic engine. Propagated unchanged.
    #[error(transparent)]
    Traffic(#[from] TrafficError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
