use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;

use crate::error::{Result, SimError};
use crate::primitives::{FVal, Time};
use crate::station::{CsIdx, FastStation, SlowRegistry, Station, StationRegistry};
use crate::telemetry::{Arrival, TripLog};
use crate::traffic::TrafficEngine;
use crate::vehicle::{Fleet, VehIdx, VehStatus};

/// Failed station-less departures of slow-charging vehicles retry after this.
const REDEPART_DELAY: Time = 15 * 60;
/// A depleted vehicle is dragged to its fallback station after this.
const DEPLETION_DRAG_DELAY: Time = 3600;
/// Candidate pool size for the nearest-station screening.
const NEAR_CANDIDATES: usize = 10;
/// Queue wait penalty per vehicle beyond the slot count, minutes.
const QUEUE_WAIT_PENALTY_MIN: FVal = 30.0;

/// The scheduling engine. Owns the fleet and both station registries, drives
/// the traffic engine step by step, and recovers fleet-operational failures
/// through its two retry queues.
///
/// Everything runs synchronously inside [Simulation::step]; the queues pop
/// strictly by (time, vehicle index) so re-enqueued entries replay
/// deterministically.
pub struct Simulation<T: TrafficEngine> {
    time: Time,
    start: Time,
    end: Time,
    step_len: Time,
    fleet: Fleet,
    fast: StationRegistry<FastStation>,
    slow: SlowRegistry,
    depart_queue: BinaryHeap<Reverse<(Time, VehIdx)>>,
    retry_queue: BinaryHeap<Reverse<(Time, VehIdx)>>,
    traffic: T,
    log: Option<TripLog>,
}

impl<T: TrafficEngine> Simulation<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: Time,
        end: Time,
        step_len: Time,
        fleet: Fleet,
        fast: StationRegistry<FastStation>,
        slow: SlowRegistry,
        traffic: T,
        log: Option<TripLog>,
    ) -> Self {
        Self {
            time: start,
            start,
            end,
            step_len,
            fleet,
            fast,
            slow,
            depart_queue: BinaryHeap::new(),
            retry_queue: BinaryHeap::new(),
            traffic,
            log,
        }
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn start_time(&self) -> Time {
        self.start
    }

    pub fn end_time(&self) -> Time {
        self.end
    }

    pub fn step_length(&self) -> Time {
        self.step_len
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn fleet_mut(&mut self) -> &mut Fleet {
        &mut self.fleet
    }

    /// Enqueues a departure attempt for a vehicle at the given time.
    pub fn queue_departure(&mut self, vid: VehIdx, at: Time) {
        self.depart_queue.push(Reverse((at, vid)));
    }

    pub fn fast(&self) -> &StationRegistry<FastStation> {
        &self.fast
    }

    pub fn fast_mut(&mut self) -> &mut StationRegistry<FastStation> {
        &mut self.fast
    }

    pub fn slow(&self) -> &SlowRegistry {
        &self.slow
    }

    pub fn slow_mut(&mut self) -> &mut SlowRegistry {
        &mut self.slow
    }

    pub fn traffic(&self) -> &T {
        &self.traffic
    }

    pub fn set_v2g_demand(&mut self, cs: CsIdx, demand: FVal) {
        self.slow.set_v2g_demand(cs, demand);
    }

    pub fn clear_v2g_demand(&mut self) {
        self.slow.clear_v2g_demand();
    }

    /// Starts the scenario: boots the engine, queues every vehicle's first
    /// departure, resolves station positions and runs the departures already
    /// due.
    pub fn start(&mut self) -> Result<()> {
        self.traffic.start()?;
        self.time = self.traffic.time();
        self.depart_queue.clear();
        for i in 0..self.fleet.len() {
            let vid = VehIdx(i as u32);
            let depart = self.fleet.veh(vid).current_trip().depart;
            self.depart_queue.push(Reverse((depart, vid)));
        }
        self.assign_station_positions()?;
        self.batch_depart()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.traffic.stop()?;
        if let Some(lg) = self.log.as_mut() {
            lg.flush();
        }
        Ok(())
    }

    /// Advances one step of `len` (default: the configured step length)
    /// simulated seconds and processes everything that happened in it.
    pub fn step(&mut self, len: Option<Time>) -> Result<()> {
        let len = len.unwrap_or(self.step_len);
        let new_time = self.traffic.advance(self.time + len)?;
        let dt = new_time - self.time;
        self.time = new_time;

        let arrived = self.traffic.arrived_vehicles()?;
        let active = self.traffic.active_vehicles()?;

        for name in &arrived {
            let vid = self.fleet.index_of(name)?;
            let target = self.fleet.veh(vid).target_cs;
            match target {
                None => self.end_trip(vid)?,
                Some(cs) => {
                    self.fleet.veh_mut(vid).status = VehStatus::Charging;
                    self.fast.add_veh(vid, cs);
                    if let Some(lg) = self.log.as_mut() {
                        lg.arrive_fast(self.time, self.fleet.veh(vid), &self.fast.station(cs).base().id);
                    }
                }
            }
        }

        for name in &active {
            let vid = self.fleet.index_of(name)?;
            let dist = self.traffic.distance_of(name)?;
            self.fleet.veh_mut(vid).drive(dist, self.time)?;

            if self.fleet.veh(vid).batt_elec <= 0.0 {
                let edge = self.traffic.edge_of(name)?;
                self.set_depleted_at(vid, &edge)?;
                self.traffic.remove_vehicle(name)?;
                continue;
            }
            if self.fleet.veh(vid).status == VehStatus::Pending {
                self.fleet.veh_mut(vid).status = VehStatus::Driving;
            }
            if self.fleet.veh(vid).status != VehStatus::Driving {
                return Err(SimError::VehicleState(format!(
                    "traffic engine and scheduler disagree on vehicle {} (status {:?}) at {}",
                    name,
                    self.fleet.veh(vid).status,
                    self.time
                )));
            }

            let stale_target = match self.fleet.veh(vid).target_cs {
                Some(cs) => !self.fast.station(cs).base().is_online(self.time),
                None => false,
            };
            if stale_target {
                self.redirect_or_deplete(vid, name)?;
            }
        }

        self.update_fast(dt)?;
        self.update_slow(dt)?;
        self.batch_depart()?;
        self.drain_retries()
    }

    /// Picks the cheapest reachable online fast station for a vehicle at
    /// `edge`, weighing travel and queueing time against the cost of the
    /// missing charge. Candidates come from the spatial index, with a linear
    /// scan over everything when the index cannot answer.
    fn best_fast_station(&self, vid: VehIdx, edge: &str, x: FVal, y: FVal) -> Result<Option<CsIdx>> {
        let ev = self.fleet.veh(vid);
        let candidates = match self.fast.select_near(x, y, NEAR_CANDIDATES) {
            Some(near) => near,
            None => self.fast.indices().collect(),
        };
        let mut best: Option<(CsIdx, FVal)> = None;
        for cs_idx in candidates {
            let cs = self.fast.station(cs_idx);
            if !cs.base().is_online(self.time) {
                continue;
            }
            let route = self.traffic.find_route(edge, &cs.base().edge)?;
            if route.length > ev.max_mileage() {
                continue;
            }
            let t_drive = route.travel_time / 60.0;
            let t_wait =
                QUEUE_WAIT_PENALTY_MIN * (cs.veh_count(false) as FVal - cs.base().slots as FVal).max(0.0);
            let weight = ev.omega * (t_drive + t_wait)
                + (ev.batt_cap - ev.batt_elec) * cs.base().price_buy_at(self.time);
            if best.map_or(true, |(_, w)| weight < w) {
                best = Some((cs_idx, weight));
            }
        }
        Ok(best.map(|(cs, _)| cs))
    }

    /// A driving vehicle's target station went offline: move it to the next
    /// best station, or hand it to the depletion fallback when none is
    /// reachable.
    fn redirect_or_deplete(&mut self, vid: VehIdx, name: &str) -> Result<()> {
        let old_name = match self.fleet.veh(vid).target_cs {
            Some(cs) => self.fast.station(cs).base().id.clone(),
            None => "None".to_string(),
        };
        let edge = self.traffic.edge_of(name)?;
        let (x, y) = self.traffic.edge_position(&edge)?;
        match self.best_fast_station(vid, &edge, x, y)? {
            Some(new_cs) => {
                self.fleet.veh_mut(vid).target_cs = Some(new_cs);
                let new_edge = self.fast.station(new_cs).base().edge.clone();
                self.traffic.change_target(name, &new_edge)?;
                if let Some(lg) = self.log.as_mut() {
                    lg.fault_redirect(
                        self.time,
                        self.fleet.veh(vid),
                        &old_name,
                        &self.fast.station(new_cs).base().id,
                    );
                }
            }
            None => {
                self.set_depleted_at(vid, &edge)?;
                self.traffic.remove_vehicle(name)?;
                if let Some(lg) = self.log.as_mut() {
                    lg.fault_nocharge(self.time, self.fleet.veh(vid), &old_name);
                }
            }
        }
        Ok(())
    }

    fn update_fast(&mut self, dt: Time) -> Result<()> {
        for i in 0..self.fast.len() {
            let cs = CsIdx(i as u32);
            let finished = self.fast.station_mut(cs).update(&mut self.fleet, dt, self.time, 0.0)?;
            if finished.is_empty() {
                continue;
            }
            let station_id = self.fast.station(cs).base().id.clone();
            let station_edge = self.fast.station(cs).base().edge.clone();
            // Full vehicles resume their trip from here; offline evictions
            // take the same path, target cleared, and re-arrive as normal
            // trip completions.
            for vid in finished {
                self.fast.pop_veh(vid);
                if self.fleet.veh(vid).target_cs.is_none() {
                    return Err(SimError::VehicleState(format!(
                        "vehicle {:?} left fast charging at '{station_id}' without a target station",
                        vid
                    )));
                }
                let to_edge = self.fleet.veh(vid).current_trip().to_edge().to_string();
                self.insert_into_traffic(vid, &station_edge, &to_edge)?;
                let ev = self.fleet.veh_mut(vid);
                ev.target_cs = None;
                ev.status = VehStatus::Pending;
                ev.clear_applied_pc();
                if let Some(lg) = self.log.as_mut() {
                    lg.depart_fast(self.time, self.fleet.veh(vid), &station_id);
                }
            }
        }
        Ok(())
    }

    fn update_slow(&mut self, dt: Time) -> Result<()> {
        let left = self.slow.update_all(&mut self.fleet, dt, self.time)?;
        for (cs, vid) in left {
            if let Some(lg) = self.log.as_mut() {
                lg.leave_slow(
                    self.time,
                    self.fleet.veh(vid),
                    &self.slow.stations().station(cs).base().id,
                );
            }
        }
        Ok(())
    }

    /// Pops every due departure and tries to start the trip. A vehicle that
    /// cannot reach any station re-queues 15 minutes later if it is still
    /// slow charging, and falls into the depletion fallback otherwise.
    fn batch_depart(&mut self) -> Result<()> {
        while let Some(&Reverse((depart, vid))) = self.depart_queue.peek() {
            if depart > self.time {
                break;
            }
            self.depart_queue.pop();
            let status = self.fleet.veh(vid).status;
            if status != VehStatus::Charging && status != VehStatus::Parking {
                return Err(SimError::VehicleState(format!(
                    "cannot depart vehicle {} at {}: it is {:?}, neither charging nor parking",
                    self.fleet.veh(vid).id,
                    self.time,
                    status
                )));
            }
            if self.start_trip(vid)? {
                let delay = (self.time - depart).max(0);
                let cs_name = self
                    .fleet
                    .veh(vid)
                    .target_cs
                    .map(|cs| self.fast.station(cs).base().id.clone());
                if let Some(lg) = self.log.as_mut() {
                    lg.depart(self.time, self.fleet.veh(vid), delay, cs_name.as_deref());
                }
            } else if self.slow.stations().is_charging(vid) {
                if let Some(lg) = self.log.as_mut() {
                    lg.depart_delayed(self.time, self.fleet.veh(vid), REDEPART_DELAY);
                }
                self.depart_queue.push(Reverse((depart + REDEPART_DELAY, vid)));
            } else {
                if let Some(lg) = self.log.as_mut() {
                    lg.depart_failed(self.time, self.fleet.veh(vid), "None");
                }
                let from_edge = self.fleet.veh(vid).current_trip().from_edge().to_string();
                self.set_depleted_at(vid, &from_edge)?;
            }
        }
        Ok(())
    }

    /// Sends a vehicle out on its current trip. With enough charge it heads
    /// straight for the destination; otherwise it detours via the best
    /// reachable fast station. False when no station qualifies.
    fn start_trip(&mut self, vid: VehIdx) -> Result<bool> {
        let (from_edge, to_edge, skip_station) = {
            let ev = self.fleet.veh(vid);
            let trip = ev.current_trip();
            (
                trip.from_edge().to_string(),
                trip.to_edge().to_string(),
                ev.soc() >= ev.k_fast,
            )
        };
        if skip_station {
            self.fleet.veh_mut(vid).target_cs = None;
            self.insert_into_traffic(vid, &from_edge, &to_edge)?;
        } else {
            let (x, y) = self.traffic.edge_position(&from_edge)?;
            let Some(cs) = self.best_fast_station(vid, &from_edge, x, y)? else {
                return Ok(false);
            };
            self.fleet.veh_mut(vid).target_cs = Some(cs);
            let cs_edge = self.fast.station(cs).base().edge.clone();
            self.insert_into_traffic(vid, &from_edge, &cs_edge)?;
        }
        self.slow.stations_mut().pop_veh(vid);
        let ev = self.fleet.veh_mut(vid);
        ev.clear_applied_pc();
        ev.status = VehStatus::Pending;
        Ok(true)
    }

    /// Completes the current trip: park, join a slow station at the
    /// destination when the battery warrants it, and queue the next trip.
    fn end_trip(&mut self, vid: VehIdx) -> Result<()> {
        self.fleet.veh_mut(vid).status = VehStatus::Parking;
        let wants_charge = {
            let ev = self.fleet.veh(vid);
            ev.soc() < ev.k_slow
        };
        let mut joined: Option<CsIdx> = None;
        let mut status = Arrival::NoCharge;
        if wants_charge {
            let to_edge = self.fleet.veh(vid).current_trip().to_edge().to_string();
            let at_destination = self.slow.stations().index_at_edge(&to_edge);
            status = match at_destination {
                Some(cs) if self.slow.stations_mut().add_veh(vid, cs) => {
                    joined = Some(cs);
                    Arrival::ChargeOk
                }
                _ => Arrival::ChargeFailed,
            };
        }
        if let Some(lg) = self.log.as_mut() {
            lg.arrive(self.time, self.fleet.veh(vid), status);
            if let Some(cs) = joined {
                lg.join_slow(self.time, self.fleet.veh(vid), &self.slow.stations().station(cs).base().id);
            }
        }
        if self.fleet.veh_mut(vid).advance_trip().is_some() {
            let depart = self.fleet.veh(vid).current_trip().depart;
            self.depart_queue.push(Reverse((depart, vid)));
        }
        Ok(())
    }

    /// Depletion fallback: mark the vehicle depleted, aim it at the nearest
    /// fast station and schedule the drag there. Non-fatal by design.
    fn set_depleted_at(&mut self, vid: VehIdx, edge: &str) -> Result<()> {
        let (x, y) = self.traffic.edge_position(edge)?;
        let target = self.fast.nearest(x, y);
        {
            let ev = self.fleet.veh_mut(vid);
            ev.status = VehStatus::Depleted;
            ev.target_cs = target;
        }
        self.retry_queue.push(Reverse((self.time + DEPLETION_DRAG_DELAY, vid)));
        debug!("vehicle {} depleted at '{edge}'", self.fleet.veh(vid).id);
        let cs_name = match target {
            Some(cs) => self.fast.station(cs).base().id.clone(),
            None => "None".to_string(),
        };
        if let Some(lg) = self.log.as_mut() {
            lg.fault_deplete(self.time, self.fleet.veh(vid), &cs_name);
        }
        Ok(())
    }

    /// Pops every due depletion drag and registers the vehicle with its
    /// fallback station. A failed registration forces the battery to 50%
    /// instead of looping indefinitely.
    fn drain_retries(&mut self) -> Result<()> {
        while let Some(&Reverse((due, vid))) = self.retry_queue.peek() {
            if due > self.time {
                break;
            }
            self.retry_queue.pop();
            self.fleet.veh_mut(vid).status = VehStatus::Charging;
            let target = self.fleet.veh(vid).target_cs;
            let added = match target {
                Some(cs) if self.fast.add_veh(vid, cs) => Some(cs),
                _ => None,
            };
            if let Some(cs) = added {
                if let Some(lg) = self.log.as_mut() {
                    lg.arrive_fast(self.time, self.fleet.veh(vid), &self.fast.station(cs).base().id);
                }
            } else {
                if let Some(lg) = self.log.as_mut() {
                    lg.fault_nocharge(self.time, self.fleet.veh(vid), "None");
                }
                let ev = self.fleet.veh_mut(vid);
                ev.batt_elec = ev.batt_cap * 0.5;
            }
        }
        Ok(())
    }

    fn insert_into_traffic(&mut self, vid: VehIdx, from_edge: &str, to_edge: &str) -> Result<()> {
        self.fleet.veh_mut(vid).distance = 0.0;
        let id = self.fleet.veh(vid).id.clone();
        self.traffic.insert_vehicle(&id, from_edge, to_edge)?;
        Ok(())
    }

    /// Resolves station positions from their edges and builds both spatial
    /// indexes. Runs once; later calls are no-ops.
    fn assign_station_positions(&mut self) -> Result<()> {
        if !self.fast.tree_ready() {
            for i in 0..self.fast.len() {
                let cs = CsIdx(i as u32);
                if self.fast.station(cs).base().position().is_none() {
                    let edge = self.fast.station(cs).base().edge.clone();
                    let (x, y) = self.traffic.edge_position(&edge)?;
                    self.fast.station_mut(cs).base_mut().set_position(x, y);
                }
            }
            self.fast.rebuild_tree();
        }
        if !self.slow.stations().tree_ready() {
            for i in 0..self.slow.stations().len() {
                let cs = CsIdx(i as u32);
                if self.slow.stations().station(cs).base().position().is_none() {
                    let edge = self.slow.stations().station(cs).base().edge.clone();
                    let (x, y) = self.traffic.edge_position(&edge)?;
                    self.slow.stations_mut().station_mut(cs).base_mut().set_position(x, y);
                }
            }
            self.slow.stations_mut().rebuild_tree();
        }
        Ok(())
    }
}
