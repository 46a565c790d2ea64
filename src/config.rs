use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::curve::{StepCurve, TimeWindows};
use crate::error::{Result, SimError};
use crate::market::AllocPool;
use crate::primitives::{kw_to_kwhps, FVal, Time};
use crate::station::{FastStation, SlowRegistry, SlowStation, StationRegistry};
use crate::traffic::line::{Edge, LineTraffic};
use crate::vehicle::{BattCorrPool, Fleet, Trip, Vehicle, VehicleParams};

fn default_loop_times() -> i32 {
    1
}
fn default_eta() -> FVal {
    0.9
}
fn default_soc() -> FVal {
    0.9
}
fn default_omega() -> FVal {
    1.0
}
fn default_k_rel() -> FVal {
    1.25
}
fn default_k_fast() -> FVal {
    0.2
}
fn default_k_slow() -> FVal {
    0.5
}
fn default_k_v2g() -> FVal {
    0.8
}
fn default_corr() -> String {
    "Linear".to_string()
}
fn default_max_slow_cost() -> FVal {
    100.0
}
fn default_alloc() -> String {
    "Average".to_string()
}
fn default_power_limit_kw() -> FVal {
    1e9
}
fn default_speed() -> FVal {
    13.9
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurveSpec {
    pub points: Vec<(Time, FVal)>,
    #[serde(default)]
    pub loop_period: Time,
    #[serde(default = "default_loop_times")]
    pub loop_times: i32,
}

impl CurveSpec {
    pub fn build(&self) -> Result<StepCurve> {
        let (times, values) = self.points.iter().copied().unzip();
        StepCurve::new(times, values, self.loop_period, self.loop_times)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowsSpec {
    pub spans: Vec<(Time, Time)>,
    #[serde(default)]
    pub loop_period: Time,
    #[serde(default = "default_loop_times")]
    pub loop_times: i32,
}

impl WindowsSpec {
    pub fn build(&self) -> Result<TimeWindows> {
        TimeWindows::new(self.spans.clone(), self.loop_period, self.loop_times)
    }
}

/// Missing window elements fall back to a forced constant answer.
fn windows_or(spec: Option<&WindowsSpec>, absent_value: bool) -> Result<TimeWindows> {
    match spec {
        Some(w) => w.build(),
        None => Ok(TimeWindows::always(absent_value)),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripSpec {
    pub id: String,
    pub depart: Time,
    #[serde(default)]
    pub from_taz: String,
    #[serde(default)]
    pub to_taz: String,
    pub route: Vec<String>,
    #[serde(default)]
    pub fixed_route: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleSpec {
    pub id: String,
    pub trips: Vec<TripSpec>,
    #[serde(default = "default_eta")]
    pub eta_c: FVal,
    #[serde(default = "default_eta")]
    pub eta_d: FVal,
    pub cap_kwh: FVal,
    #[serde(default = "default_soc")]
    pub soc: FVal,
    /// Consumption, Wh per meter.
    pub wh_per_m: FVal,
    pub pc_fast_kw: FVal,
    pub pc_slow_kw: FVal,
    pub pd_v2g_kw: FVal,
    #[serde(default = "default_omega")]
    pub omega: FVal,
    #[serde(default = "default_k_rel")]
    pub k_rel: FVal,
    #[serde(default = "default_k_fast")]
    pub k_fast: FVal,
    #[serde(default = "default_k_slow")]
    pub k_slow: FVal,
    #[serde(default = "default_k_v2g")]
    pub k_v2g: FVal,
    #[serde(default = "default_corr")]
    pub corr: String,
    #[serde(default)]
    pub slow_charge_windows: Option<WindowsSpec>,
    #[serde(default = "default_max_slow_cost")]
    pub max_slow_cost: FVal,
    #[serde(default)]
    pub v2g_windows: Option<WindowsSpec>,
    #[serde(default)]
    pub min_v2g_revenue: FVal,
}

impl VehicleSpec {
    pub fn build(&self, corr_pool: &BattCorrPool) -> Result<Vehicle> {
        let mut trips = Vec::with_capacity(self.trips.len());
        for t in &self.trips {
            trips.push(Trip::new(
                t.id.clone(),
                t.depart,
                t.from_taz.clone(),
                t.to_taz.clone(),
                t.route.clone(),
                t.fixed_route,
            )?);
        }
        let params = VehicleParams {
            eta_c: self.eta_c,
            eta_d: self.eta_d,
            cap_kwh: self.cap_kwh,
            soc: self.soc,
            wh_per_m: self.wh_per_m,
            pc_fast_kw: self.pc_fast_kw,
            pc_slow_kw: self.pc_slow_kw,
            pd_v2g_kw: self.pd_v2g_kw,
            omega: self.omega,
            k_rel: self.k_rel,
            k_fast: self.k_fast,
            k_slow: self.k_slow,
            k_v2g: self.k_v2g,
            max_slow_cost: self.max_slow_cost,
            min_v2g_revenue: self.min_v2g_revenue,
        };
        Vehicle::new(
            self.id.clone(),
            trips,
            params,
            windows_or(self.slow_charge_windows.as_ref(), true)?,
            windows_or(self.v2g_windows.as_ref(), true)?,
            corr_pool.get(&self.corr)?,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationSpec {
    pub id: String,
    pub edge: String,
    pub slots: usize,
    #[serde(default)]
    pub bus: String,
    #[serde(default)]
    pub x: Option<FVal>,
    #[serde(default)]
    pub y: Option<FVal>,
    #[serde(default)]
    pub offline: Option<WindowsSpec>,
    #[serde(default = "default_power_limit_kw")]
    pub max_pc_kw: FVal,
    #[serde(default = "default_power_limit_kw")]
    pub max_pd_kw: FVal,
    pub price_buy: CurveSpec,
    #[serde(default)]
    pub price_sell: Option<CurveSpec>,
    #[serde(default = "default_alloc")]
    pub alloc: String,
}

impl StationSpec {
    fn pos(&self) -> Option<(FVal, FVal)> {
        self.x.zip(self.y)
    }

    pub fn build_fast(&self, alloc_pool: &AllocPool) -> Result<FastStation> {
        FastStation::new(
            self.id.clone(),
            self.edge.clone(),
            self.slots,
            self.bus.clone(),
            self.pos(),
            windows_or(self.offline.as_ref(), false)?,
            kw_to_kwhps(self.max_pc_kw),
            self.price_buy.build()?,
            alloc_pool.get("")?,
        )
    }

    pub fn build_slow(&self, alloc_pool: &AllocPool) -> Result<SlowStation> {
        let price_sell = match &self.price_sell {
            Some(spec) => spec.build()?,
            None => StepCurve::empty(),
        };
        SlowStation::new(
            self.id.clone(),
            self.edge.clone(),
            self.slots,
            self.bus.clone(),
            self.pos(),
            windows_or(self.offline.as_ref(), false)?,
            kw_to_kwhps(self.max_pc_kw),
            kw_to_kwhps(self.max_pd_kw),
            self.price_buy.build()?,
            price_sell,
            alloc_pool.get(&self.alloc)?,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub x: FVal,
    pub y: FVal,
}

/// A whole scenario as one deserializable record. Numeric validation happens
/// in the core constructors, so a parsed scenario can still fail to build.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_speed")]
    pub speed_mps: FVal,
    pub edges: Vec<EdgeSpec>,
    pub vehicles: Vec<VehicleSpec>,
    #[serde(default)]
    pub fast_stations: Vec<StationSpec>,
    #[serde(default)]
    pub slow_stations: Vec<StationSpec>,
}

pub struct ScenarioParts {
    pub fleet: Fleet,
    pub fast: StationRegistry<FastStation>,
    pub slow: SlowRegistry,
    pub traffic: LineTraffic,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file)
            .map_err(|e| SimError::Config(format!("cannot parse scenario: {e}")))
    }

    pub fn build(&self, corr_pool: &BattCorrPool, alloc_pool: &AllocPool) -> Result<ScenarioParts> {
        let mut fleet = Fleet::new();
        for spec in &self.vehicles {
            fleet.add(spec.build(corr_pool)?)?;
        }
        let fast = StationRegistry::new(
            self.fast_stations
                .iter()
                .map(|s| s.build_fast(alloc_pool))
                .collect::<Result<Vec<_>>>()?,
        )?;
        let slow = SlowRegistry::new(
            self.slow_stations
                .iter()
                .map(|s| s.build_slow(alloc_pool))
                .collect::<Result<Vec<_>>>()?,
        )?;
        let edges = self.edges.iter().map(|e| Edge::new(e.id.clone(), e.x, e.y)).collect();
        let traffic = LineTraffic::new(edges, self.speed_mps)?;
        Ok(ScenarioParts {
            fleet,
            fast,
            slow,
            traffic,
        })
    }
}
