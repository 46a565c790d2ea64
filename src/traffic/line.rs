use crate::col::{map_new, HashMap};
use crate::primitives::{FVal, Time};
use crate::traffic::{RouteEstimate, TrafficEngine, TrafficError};

/// A named road segment with a representative position.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: String,
    pub x: FVal,
    pub y: FVal,
}

impl Edge {
    pub fn new(id: impl Into<String>, x: FVal, y: FVal) -> Self {
        Self { id: id.into(), x, y }
    }
}

struct MovingVeh {
    name: String,
    x: FVal,
    y: FVal,
    target_edge: usize,
    current_edge: usize,
    /// Odometer since insertion, meters.
    dist: FVal,
}

/// A stand-in movement engine: vehicles travel in a straight line between
/// edge positions at a constant speed. No road network, no congestion; just
/// enough physics to exercise the scheduling core end to end and in tests.
pub struct LineTraffic {
    edges: Vec<Edge>,
    edge_index: HashMap<String, usize>,
    speed: FVal,
    time: Time,
    // Tombstoned so identifiers keep a deterministic iteration order.
    moving: Vec<Option<MovingVeh>>,
    by_name: HashMap<String, usize>,
    arrived: Vec<String>,
    started: bool,
}

impl LineTraffic {
    pub fn new(edges: Vec<Edge>, speed_mps: FVal) -> Result<Self, TrafficError> {
        let mut edge_index = map_new();
        for (i, e) in edges.iter().enumerate() {
            if edge_index.insert(e.id.clone(), i).is_some() {
                return Err(TrafficError::Transport(format!("duplicate edge '{}'", e.id)));
            }
        }
        Ok(Self {
            edges,
            edge_index,
            speed: speed_mps,
            time: 0,
            moving: Vec::new(),
            by_name: map_new(),
            arrived: Vec::new(),
            started: false,
        })
    }

    fn edge_idx(&self, edge: &str) -> Result<usize, TrafficError> {
        self.edge_index
            .get(edge)
            .copied()
            .ok_or_else(|| TrafficError::UnknownEdge(edge.to_string()))
    }

    fn veh(&self, name: &str) -> Result<&MovingVeh, TrafficError> {
        self.by_name
            .get(name)
            .and_then(|&slot| self.moving[slot].as_ref())
            .ok_or_else(|| TrafficError::UnknownVehicle(name.to_string()))
    }
}

impl TrafficEngine for LineTraffic {
    fn start(&mut self) -> Result<(), TrafficError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TrafficError> {
        self.started = false;
        self.moving.clear();
        self.by_name.clear();
        self.arrived.clear();
        Ok(())
    }

    fn advance(&mut self, until: Time) -> Result<Time, TrafficError> {
        if !self.started {
            return Err(TrafficError::Transport("engine not started".to_string()));
        }
        let dt = (until - self.time).max(0) as FVal;
        self.time = self.time.max(until);
        self.arrived.clear();

        for slot in &mut self.moving {
            let Some(veh) = slot else { continue };
            let target = &self.edges[veh.target_edge];
            let dx = target.x - veh.x;
            let dy = target.y - veh.y;
            let remaining = (dx * dx + dy * dy).sqrt();
            let step = self.speed * dt;
            if step >= remaining {
                veh.dist += remaining;
                veh.x = target.x;
                veh.y = target.y;
                veh.current_edge = veh.target_edge;
                self.arrived.push(veh.name.clone());
                self.by_name.remove(&veh.name);
                *slot = None;
            } else {
                veh.x += dx / remaining * step;
                veh.y += dy / remaining * step;
                veh.dist += step;
            }
        }
        Ok(self.time)
    }

    fn time(&self) -> Time {
        self.time
    }

    fn active_vehicles(&self) -> Result<Vec<String>, TrafficError> {
        Ok(self
            .moving
            .iter()
            .filter_map(|slot| slot.as_ref().map(|v| v.name.clone()))
            .collect())
    }

    fn arrived_vehicles(&self) -> Result<Vec<String>, TrafficError> {
        Ok(self.arrived.clone())
    }

    fn distance_of(&self, veh: &str) -> Result<FVal, TrafficError> {
        Ok(self.veh(veh)?.dist)
    }

    fn edge_of(&self, veh: &str) -> Result<String, TrafficError> {
        let v = self.veh(veh)?;
        Ok(self.edges[v.current_edge].id.clone())
    }

    fn insert_vehicle(
        &mut self,
        veh: &str,
        from_edge: &str,
        to_edge: &str,
    ) -> Result<(), TrafficError> {
        if self.by_name.contains_key(veh) {
            return Err(TrafficError::DuplicateVehicle(veh.to_string()));
        }
        let from = self.edge_idx(from_edge)?;
        let to = self.edge_idx(to_edge)?;
        let start = &self.edges[from];
        let slot = self.moving.len();
        self.moving.push(Some(MovingVeh {
            name: veh.to_string(),
            x: start.x,
            y: start.y,
            target_edge: to,
            current_edge: from,
            dist: 0.0,
        }));
        self.by_name.insert(veh.to_string(), slot);
        Ok(())
    }

    fn change_target(&mut self, veh: &str, to_edge: &str) -> Result<(), TrafficError> {
        let to = self.edge_idx(to_edge)?;
        let slot = *self
            .by_name
            .get(veh)
            .ok_or_else(|| TrafficError::UnknownVehicle(veh.to_string()))?;
        match &mut self.moving[slot] {
            Some(v) => {
                v.target_edge = to;
                Ok(())
            }
            None => Err(TrafficError::UnknownVehicle(veh.to_string())),
        }
    }

    fn remove_vehicle(&mut self, veh: &str) -> Result<(), TrafficError> {
        let slot = self
            .by_name
            .remove(veh)
            .ok_or_else(|| TrafficError::UnknownVehicle(veh.to_string()))?;
        self.moving[slot] = None;
        Ok(())
    }

    fn find_route(&self, from_edge: &str, to_edge: &str) -> Result<RouteEstimate, TrafficError> {
        let from = &self.edges[self.edge_idx(from_edge)?];
        let to = &self.edges[self.edge_idx(to_edge)?];
        let dx = to.x - from.x;
        let dy = to.y - from.y;
        let length = (dx * dx + dy * dy).sqrt();
        Ok(RouteEstimate {
            length,
            travel_time: length / self.speed,
        })
    }

    fn edge_position(&self, edge: &str) -> Result<(FVal, FVal), TrafficError> {
        let e = &self.edges[self.edge_idx(edge)?];
        Ok((e.x, e.y))
    }
}
