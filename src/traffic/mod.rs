pub mod line;

use thiserror::Error;

use crate::primitives::{FVal, Time};

/// Transport-level failures of the movement engine. The scheduling core
/// cannot proceed without its engine, so these propagate unchanged.
#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("unknown edge '{0}'")]
    UnknownEdge(String),

    #[error("unknown vehicle '{0}'")]
    UnknownVehicle(String),

    #[error("vehicle '{0}' is already in traffic")]
    DuplicateVehicle(String),

    #[error("no route from '{from}' to '{to}'")]
    NoRoute { from: String, to: String },

    #[error("traffic engine transport failure: {0}")]
    Transport(String),
}

/// Length and travel time of a queried route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    /// Meters.
    pub length: FVal,
    /// Seconds.
    pub travel_time: FVal,
}

/// The road-network movement engine the scheduling core drives.
///
/// Vehicle physics, routing and arrival detection live behind this trait;
/// the core only reads back identifiers, distances and road segments and
/// issues insert/redirect/remove commands.
pub trait TrafficEngine {
    fn start(&mut self) -> Result<(), TrafficError>;

    fn stop(&mut self) -> Result<(), TrafficError>;

    /// Advances the engine to (at most) the target time and returns the
    /// engine's resulting current time.
    fn advance(&mut self, until: Time) -> Result<Time, TrafficError>;

    fn time(&self) -> Time;

    /// Vehicles currently moving in the engine.
    fn active_vehicles(&self) -> Result<Vec<String>, TrafficError>;

    /// Vehicles that reached their destination during the last advance.
    fn arrived_vehicles(&self) -> Result<Vec<String>, TrafficError>;

    /// Meters driven by the vehicle since it was inserted.
    fn distance_of(&self, veh: &str) -> Result<FVal, TrafficError>;

    /// The road segment the vehicle is currently on.
    fn edge_of(&self, veh: &str) -> Result<String, TrafficError>;

    fn insert_vehicle(&mut self, veh: &str, from_edge: &str, to_edge: &str)
        -> Result<(), TrafficError>;

    /// Redirects a moving vehicle to a new destination edge.
    fn change_target(&mut self, veh: &str, to_edge: &str) -> Result<(), TrafficError>;

    fn remove_vehicle(&mut self, veh: &str) -> Result<(), TrafficError>;

    /// Length and travel time of a route between two edges, based on the
    /// engine's aggregated travel-time estimates.
    fn find_route(&self, from_edge: &str, to_edge: &str) -> Result<RouteEstimate, TrafficError>;

    /// A representative position for an edge.
    fn edge_position(&self, edge: &str) -> Result<(FVal, FVal), TrafficError>;
}
