use std::fmt::Debug;
use std::sync::Arc;

use crate::col::{map_new, HashMap};
use crate::curve::TimeWindows;
use crate::error::{Result, SimError};
use crate::primitives::{kw_to_kwhps, kwhps_to_kw, FVal, Time};
use crate::station::CsIdx;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehIdx(pub u32);
impl Debug for VehIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("v#{}", self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehStatus {
    Driving,
    Pending,
    Charging,
    Parking,
    Depleted,
}

impl VehStatus {
    /// Numeric code used in snapshot output.
    pub fn code(self) -> u8 {
        match self {
            VehStatus::Driving => 0,
            VehStatus::Pending => 1,
            VehStatus::Charging => 2,
            VehStatus::Parking => 3,
            VehStatus::Depleted => 4,
        }
    }
}

/// One leg of a vehicle's itinerary. Immutable once built.
#[derive(Debug, Clone)]
pub struct Trip {
    pub id: String,
    pub depart: Time,
    pub from_taz: String,
    pub to_taz: String,
    route: Vec<String>,
    pub fixed_route: bool,
}

impl Trip {
    /// `fixed_route = None` auto-detects: a route is considered fixed when it
    /// lists more than just its two endpoint edges.
    pub fn new(
        id: String,
        depart: Time,
        from_taz: String,
        to_taz: String,
        route: Vec<String>,
        fixed_route: Option<bool>,
    ) -> Result<Self> {
        if route.len() < 2 {
            return Err(SimError::Config(format!(
                "trip '{id}' must list at least its origin and destination edge"
            )));
        }
        let fixed = fixed_route.unwrap_or(route.len() > 2);
        Ok(Self {
            id,
            depart,
            from_taz,
            to_taz,
            route,
            fixed_route: fixed,
        })
    }

    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn from_edge(&self) -> &str {
        &self.route[0]
    }

    pub fn to_edge(&self) -> &str {
        &self.route[self.route.len() - 1]
    }

    pub fn describe(&self) -> String {
        format!("{}->{}@{}", self.from_edge(), self.to_edge(), self.depart)
    }
}

/// Battery correction: (nominal power, capacity, SoC) -> effective power.
pub type BattCorr = dyn Fn(FVal, FVal, FVal) -> FVal + Send + Sync;

/// Named pool of battery correction strategies. Built once at config-load
/// time and passed into vehicle construction; never a hidden global.
pub struct BattCorrPool {
    by_name: HashMap<String, Arc<BattCorr>>,
}

impl BattCorrPool {
    pub fn with_defaults() -> Self {
        let mut pool = Self { by_name: map_new() };
        pool.add("Equal", Arc::new(|p, _cap, _soc| p));
        pool.add("Linear", Arc::new(|p, _cap, soc| {
            if soc <= 0.8 {
                p
            } else {
                p * (3.4 - 3.0 * soc)
            }
        }));
        pool
    }

    pub fn add(&mut self, name: &str, corr: Arc<BattCorr>) {
        self.by_name.insert(name.to_string(), corr);
    }

    pub fn get(&self, name: &str) -> Result<Arc<BattCorr>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("battery correction strategy '{name}'")))
    }
}

/// Vehicle parameters in configuration units (kW, kWh, Wh/m).
#[derive(Debug, Clone)]
pub struct VehicleParams {
    pub eta_c: FVal,
    pub eta_d: FVal,
    pub cap_kwh: FVal,
    pub soc: FVal,
    /// Electricity consumed per meter driven, Wh/m.
    pub wh_per_m: FVal,
    pub pc_fast_kw: FVal,
    pub pc_slow_kw: FVal,
    pub pd_v2g_kw: FVal,
    /// Weight of time against money in station choice.
    pub omega: FVal,
    /// Reachability margin on the remaining range.
    pub k_rel: FVal,
    /// SoC at or above which a trip starts without a fast-charge detour.
    pub k_fast: FVal,
    /// SoC below which the vehicle wants to slow charge on arrival.
    pub k_slow: FVal,
    /// SoC floor for V2G discharge.
    pub k_v2g: FVal,
    pub max_slow_cost: FVal,
    pub min_v2g_revenue: FVal,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self {
            eta_c: 0.9,
            eta_d: 0.9,
            cap_kwh: 50.0,
            soc: 0.9,
            wh_per_m: 0.15,
            pc_fast_kw: 100.0,
            pc_slow_kw: 7.0,
            pd_v2g_kw: 7.0,
            omega: 1.0,
            k_rel: 1.25,
            k_fast: 0.2,
            k_slow: 0.5,
            k_v2g: 0.8,
            max_slow_cost: 100.0,
            min_v2g_revenue: 0.0,
        }
    }
}

/// An electric vehicle: trip queue plus battery state.
///
/// Power fields are kWh/s internally; the config boundary speaks kW.
pub struct Vehicle {
    pub id: String,
    pub status: VehStatus,
    pub target_cs: Option<CsIdx>,
    pub cost: FVal,
    pub revenue: FVal,
    pub batt_cap: FVal,
    pub batt_elec: FVal,
    pub pc_fast: FVal,
    pub pc_slow: FVal,
    pub eta_c: FVal,
    pub pd_v2g: FVal,
    pub eta_d: FVal,
    /// kWh consumed per meter driven.
    pub consumption: FVal,
    pub omega: FVal,
    pub k_rel: FVal,
    pub k_fast: FVal,
    pub k_slow: FVal,
    pub k_v2g: FVal,
    /// Distance driven since the beginning of the current trip, meters.
    pub distance: FVal,
    pub slow_charge_windows: TimeWindows,
    pub max_slow_cost: FVal,
    pub v2g_windows: TimeWindows,
    pub min_v2g_revenue: FVal,
    trips: Vec<Trip>,
    trip_idx: usize,
    applied_pc: FVal,
    last_drive_time: Time,
    corr: Arc<BattCorr>,
}

impl Vehicle {
    pub fn new(
        id: String,
        trips: Vec<Trip>,
        params: VehicleParams,
        slow_charge_windows: TimeWindows,
        v2g_windows: TimeWindows,
        corr: Arc<BattCorr>,
    ) -> Result<Self> {
        if trips.is_empty() {
            return Err(SimError::Config(format!("vehicle '{id}' has no trips")));
        }
        if params.cap_kwh <= 0.0 || params.wh_per_m <= 0.0 {
            return Err(SimError::Config(format!(
                "vehicle '{id}' needs a positive battery capacity and consumption"
            )));
        }
        if !(0.0..=1.0).contains(&params.soc) {
            return Err(SimError::Config(format!(
                "vehicle '{id}' initial SoC ({}) must be in [0, 1]",
                params.soc
            )));
        }
        Ok(Self {
            id,
            status: VehStatus::Parking,
            target_cs: None,
            cost: 0.0,
            revenue: 0.0,
            batt_cap: params.cap_kwh,
            batt_elec: params.cap_kwh * params.soc,
            pc_fast: kw_to_kwhps(params.pc_fast_kw),
            pc_slow: kw_to_kwhps(params.pc_slow_kw),
            eta_c: params.eta_c,
            pd_v2g: kw_to_kwhps(params.pd_v2g_kw),
            eta_d: params.eta_d,
            consumption: params.wh_per_m / 1e3,
            omega: params.omega,
            k_rel: params.k_rel,
            k_fast: params.k_fast,
            k_slow: params.k_slow,
            k_v2g: params.k_v2g,
            distance: 0.0,
            slow_charge_windows,
            max_slow_cost: params.max_slow_cost,
            v2g_windows,
            min_v2g_revenue: params.min_v2g_revenue,
            trips,
            trip_idx: 0,
            applied_pc: 0.0,
            last_drive_time: -1,
            corr,
        })
    }

    pub fn soc(&self) -> FVal {
        self.batt_elec / self.batt_cap
    }

    /// Effective charging power applied by the last charge call, kWh/s.
    pub fn applied_pc(&self) -> FVal {
        self.applied_pc
    }

    pub fn applied_pc_kw(&self) -> FVal {
        kwhps_to_kw(self.applied_pc)
    }

    pub fn clear_applied_pc(&mut self) {
        self.applied_pc = 0.0;
    }

    /// Seconds to full at the currently applied power, if charging.
    pub fn est_charge_time(&self) -> Option<FVal> {
        (self.applied_pc > 0.0).then(|| ((self.batt_cap - self.batt_elec) / self.applied_pc).max(0.0))
    }

    /// Advances the trip odometer to `new_dist` meters, draining the battery
    /// accordingly. The odometer must not move backwards (1 m tolerance).
    pub fn drive(&mut self, new_dist: FVal, t: Time) -> Result<()> {
        if new_dist < self.distance - 1.0 {
            return Err(SimError::VehicleState(format!(
                "vehicle {}: distance {} @ {} > new distance {} @ {}, trip {}",
                self.id, self.distance, self.last_drive_time, new_dist, t, self.trip_idx
            )));
        }
        self.batt_elec -= (new_dist - self.distance) * self.consumption;
        self.distance = new_dist;
        self.last_drive_time = t;
        Ok(())
    }

    /// Charges for `secs` at the corrected power, clamped to capacity.
    /// Accrues cost at `unit_price` per grid kWh and returns the battery
    /// energy gained.
    pub fn charge(&mut self, secs: Time, unit_price: FVal, pc_nominal: FVal) -> FVal {
        let before = self.batt_elec;
        self.applied_pc = (self.corr)(pc_nominal, self.batt_cap, self.soc());
        self.batt_elec += self.applied_pc * secs as FVal * self.eta_c;
        if self.batt_elec > self.batt_cap {
            self.batt_elec = self.batt_cap;
        }
        let gained = self.batt_elec - before;
        self.cost += (gained / self.eta_c) * unit_price;
        gained
    }

    /// Discharges at `ratio` of the nominal V2G power for `secs`, never below
    /// the V2G SoC floor. Accrues revenue and returns the energy delivered to
    /// the grid.
    pub fn discharge(&mut self, ratio: FVal, secs: Time, unit_revenue: FVal) -> FVal {
        let before = self.batt_elec;
        self.batt_elec -= self.pd_v2g * secs as FVal * ratio;
        if self.soc() <= self.k_v2g {
            self.batt_elec = self.batt_cap * self.k_v2g;
        }
        let delivered = (before - self.batt_elec) * self.eta_d;
        self.revenue += delivered * unit_revenue;
        delivered
    }

    pub fn can_v2g(&self, t: Time, revenue: FVal) -> bool {
        self.soc() > self.k_v2g && revenue >= self.min_v2g_revenue && self.v2g_windows.contains(t)
    }

    pub fn can_slow_charge(&self, t: Time, price: FVal) -> bool {
        self.soc() < self.k_slow && price <= self.max_slow_cost && self.slow_charge_windows.contains(t)
    }

    /// Meters the remaining charge can cover.
    pub fn max_mileage(&self) -> FVal {
        self.batt_elec / self.consumption
    }

    pub fn is_range_enough(&self, dist: FVal) -> bool {
        self.max_mileage() >= self.k_rel * dist
    }

    pub fn current_trip(&self) -> &Trip {
        &self.trips[self.trip_idx]
    }

    pub fn trip_at(&self, idx: usize) -> &Trip {
        &self.trips[idx]
    }

    pub fn trips_count(&self) -> usize {
        self.trips.len()
    }

    pub fn trip_idx(&self) -> usize {
        self.trip_idx
    }

    /// Moves on to the next trip, returning its index, or None after the last.
    pub fn advance_trip(&mut self) -> Option<usize> {
        if self.trip_idx + 1 == self.trips.len() {
            return None;
        }
        self.trip_idx += 1;
        Some(self.trip_idx)
    }

    pub fn brief(&self) -> String {
        format!("{},{:.1}%,{}", self.id, self.soc() * 100.0, self.trip_idx)
    }
}

/// Owner of all vehicles; everything else refers to them by [VehIdx].
pub struct Fleet {
    vehs: Vec<Vehicle>,
    index_by_id: HashMap<String, VehIdx>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            vehs: Vec::new(),
            index_by_id: map_new(),
        }
    }

    pub fn add(&mut self, veh: Vehicle) -> Result<VehIdx> {
        if self.index_by_id.contains_key(&veh.id) {
            return Err(SimError::Config(format!("duplicate vehicle id '{}'", veh.id)));
        }
        let idx = VehIdx(self.vehs.len() as u32);
        self.index_by_id.insert(veh.id.clone(), idx);
        self.vehs.push(veh);
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.vehs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehs.is_empty()
    }

    pub fn veh(&self, idx: VehIdx) -> &Vehicle {
        &self.vehs[idx.0 as usize]
    }

    pub fn veh_mut(&mut self, idx: VehIdx) -> &mut Vehicle {
        &mut self.vehs[idx.0 as usize]
    }

    pub fn index_of(&self, id: &str) -> Result<VehIdx> {
        self.index_by_id
            .get(id)
            .copied()
            .ok_or_else(|| SimError::NotFound(format!("vehicle '{id}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehs.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = VehIdx> {
        (0..self.vehs.len() as u32).map(VehIdx)
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vehicle(soc: FVal) -> Vehicle {
        let trip = Trip::new(
            "t0".to_string(),
            0,
            String::new(),
            String::new(),
            vec!["a".to_string(), "b".to_string()],
            None,
        )
        .unwrap();
        let params = VehicleParams {
            eta_c: 0.9,
            eta_d: 0.9,
            cap_kwh: 10.0,
            soc,
            wh_per_m: 0.15, // 0.15 kWh/km
            pc_fast_kw: 36.0,
            pc_slow_kw: 3.6,
            pd_v2g_kw: 3.6,
            ..VehicleParams::default()
        };
        let pool = BattCorrPool::with_defaults();
        Vehicle::new(
            "ev0".to_string(),
            vec![trip],
            params,
            TimeWindows::always(true),
            TimeWindows::always(true),
            pool.get("Equal").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn trip_detects_fixed_route() {
        let short = Trip::new("a".into(), 0, "".into(), "".into(), vec!["x".into(), "y".into()], None).unwrap();
        assert!(!short.fixed_route);
        let long = Trip::new(
            "b".into(),
            0,
            "".into(),
            "".into(),
            vec!["x".into(), "m".into(), "y".into()],
            None,
        )
        .unwrap();
        assert!(long.fixed_route);
        assert_eq!(long.from_edge(), "x");
        assert_eq!(long.to_edge(), "y");
        assert!(Trip::new("c".into(), 0, "".into(), "".into(), vec!["x".into()], None).is_err());
    }

    #[test]
    fn drive_drains_and_rejects_backwards_motion() {
        let mut ev = test_vehicle(0.5);
        ev.drive(1000.0, 10).unwrap();
        assert!((ev.batt_elec - (5.0 - 1000.0 * 0.15e-3)).abs() < 1e-9);
        // Within the 1 m tolerance.
        ev.drive(999.5, 11).unwrap();
        assert!(ev.drive(500.0, 12).is_err());
    }

    #[test]
    fn charge_clamps_at_capacity_and_accrues_cost() {
        let mut ev = test_vehicle(0.5);
        // 36 kW nominal = 0.01 kWh/s, eta 0.9 -> 0.009 kWh/s into the battery.
        let gained = ev.charge(100, 2.0, 0.01);
        assert!((gained - 0.9).abs() < 1e-9);
        assert!((ev.cost - (0.9 / 0.9) * 2.0).abs() < 1e-9);
        assert!((ev.applied_pc() - 0.01).abs() < 1e-12);
        assert!(ev.est_charge_time().is_some());

        let gained = ev.charge(1_000_000, 2.0, 0.01);
        assert!((ev.batt_elec - ev.batt_cap).abs() < 1e-9);
        assert!(gained < 10.0);
        ev.clear_applied_pc();
        assert_eq!(ev.est_charge_time(), None);
    }

    #[test]
    fn discharge_stops_at_v2g_floor() {
        let mut ev = test_vehicle(0.9);
        // 3.6 kW = 0.001 kWh/s; floor at k_v2g = 0.8 -> only 1 kWh sellable.
        let delivered = ev.discharge(1.0, 10_000, 3.0);
        assert!((ev.soc() - 0.8).abs() < 1e-9);
        assert!((delivered - 1.0 * 0.9).abs() < 1e-9);
        assert!((ev.revenue - 0.9 * 3.0).abs() < 1e-9);
        // Another discharge at the floor moves nothing.
        assert_eq!(ev.discharge(1.0, 100, 3.0), 0.0);
    }

    #[test]
    fn eligibility_predicates_combine_soc_price_and_windows() {
        let mut ev = test_vehicle(0.9);
        assert!(ev.can_v2g(0, 0.5));
        assert!(!ev.can_slow_charge(0, 0.5));
        ev.batt_elec = ev.batt_cap * 0.3;
        assert!(!ev.can_v2g(0, 0.5));
        assert!(ev.can_slow_charge(0, 0.5));
        assert!(!ev.can_slow_charge(0, ev.max_slow_cost + 1.0));
        ev.slow_charge_windows = TimeWindows::always(false);
        assert!(!ev.can_slow_charge(0, 0.5));
        ev.min_v2g_revenue = 10.0;
        ev.batt_elec = ev.batt_cap * 0.9;
        assert!(!ev.can_v2g(0, 0.5));
        assert!(ev.can_v2g(0, 10.0));
    }

    #[test]
    fn mileage_and_reachability() {
        let ev = test_vehicle(0.5);
        assert!((ev.max_mileage() - 5.0 / 0.15e-3).abs() < 1e-6);
        assert!(ev.is_range_enough(20_000.0));
        assert!(!ev.is_range_enough(30_000.0));
    }

    #[test]
    fn fleet_indexes_by_id() {
        let mut fleet = Fleet::new();
        let idx = fleet.add(test_vehicle(0.5)).unwrap();
        assert_eq!(fleet.index_of("ev0").unwrap(), idx);
        assert!(fleet.index_of("missing").is_err());
        assert!(fleet.add(test_vehicle(0.5)).is_err());
        assert_eq!(fleet.len(), 1);
    }
}
