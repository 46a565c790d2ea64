pub mod fast;
pub mod registry;
pub mod slow;

pub use fast::FastStation;
pub use registry::{SlowRegistry, StationRegistry};
pub use slow::SlowStation;

use std::fmt::Debug;
use std::sync::Arc;

use crate::curve::{StepCurve, TimeWindows};
use crate::error::{Result, SimError};
use crate::market::AllocFn;
use crate::primitives::{kwhps_to_kw, kwhps_to_mw, FVal, Time};
use crate::vehicle::{Fleet, VehIdx};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CsIdx(pub u32);
impl Debug for CsIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("cs#{}", self.0))
    }
}

/// The capability set every charging station variant provides.
///
/// `update` advances one simulation step for the station: charging its
/// occupants, moving finished vehicles out and, where supported, clearing the
/// V2G market. It returns the vehicles that left the station's service and
/// now need handling by the orchestrator.
pub trait Station {
    fn base(&self) -> &StationBase;

    fn base_mut(&mut self) -> &mut StationBase;

    /// Accepts a vehicle, false when rejected (already present, or full for
    /// variants without an overflow buffer).
    fn add_veh(&mut self, vid: VehIdx) -> bool;

    /// Removes a vehicle from whichever internal set holds it.
    fn pop_veh(&mut self, vid: VehIdx) -> bool;

    fn has_veh(&self, vid: VehIdx) -> bool;

    fn is_charging(&self, vid: VehIdx) -> bool;

    /// Total vehicles present, across all internal sets.
    fn occupancy(&self) -> usize;

    fn veh_count(&self, only_charging: bool) -> usize;

    fn update(
        &mut self,
        fleet: &mut Fleet,
        elapsed: Time,
        t: Time,
        v2g_ratio: FVal,
    ) -> Result<Vec<VehIdx>>;

    /// Power the station could currently feed back to the grid, kWh/s.
    fn v2g_capacity(&mut self, fleet: &Fleet, t: Time) -> FVal;
}

/// State shared by both station variants.
pub struct StationBase {
    pub id: String,
    pub edge: String,
    pub slots: usize,
    pub bus: String,
    pos: Option<(FVal, FVal)>,
    offline: TimeWindows,
    price_buy: StepCurve,
    price_sell: StepCurve,
    /// Charging power limit per slot, kWh/s.
    pub slot_pc_limit: Vec<FVal>,
    pub total_pc_limit: FVal,
    /// The allocation produced by the last market clearing.
    pub pd_actual: Vec<FVal>,
    pub total_pd_limit: FVal,
    pub(crate) charge_load: FVal,
    pub(crate) discharge_load: FVal,
    pub(crate) v2g_cap: FVal,
    pub(crate) alloc: Arc<AllocFn>,
}

impl StationBase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        edge: String,
        slots: usize,
        bus: String,
        pos: Option<(FVal, FVal)>,
        offline: TimeWindows,
        total_pc_limit: FVal,
        total_pd_limit: FVal,
        price_buy: StepCurve,
        price_sell: StepCurve,
        alloc: Arc<AllocFn>,
    ) -> Result<Self> {
        if slots == 0 {
            return Err(SimError::Config(format!("station '{id}' needs at least one slot")));
        }
        if total_pc_limit < 0.0 || total_pd_limit < 0.0 {
            return Err(SimError::Config(format!(
                "station '{id}' power limits must be non-negative"
            )));
        }
        Ok(Self {
            id,
            edge,
            slots,
            bus,
            pos,
            offline,
            price_buy,
            price_sell,
            // Unless configured per slot, each slot gets an equal share.
            slot_pc_limit: vec![total_pc_limit / slots as FVal; slots],
            total_pc_limit,
            pd_actual: vec![0.0; slots],
            total_pd_limit,
            charge_load: 0.0,
            discharge_load: 0.0,
            v2g_cap: 0.0,
            alloc,
        })
    }

    pub fn price_buy_at(&self, t: Time) -> FVal {
        self.price_buy.value_at(t)
    }

    pub fn price_sell_at(&self, t: Time) -> FVal {
        self.price_sell.value_at(t)
    }

    pub fn price_buy(&mut self) -> &mut StepCurve {
        &mut self.price_buy
    }

    pub fn price_sell(&mut self) -> &mut StepCurve {
        &mut self.price_sell
    }

    pub fn supports_v2g(&self) -> bool {
        !self.price_sell.is_empty()
    }

    pub fn is_online(&self, t: Time) -> bool {
        !self.offline.contains(t)
    }

    pub fn force_offline(&mut self) {
        self.offline.force(true);
    }

    pub fn force_online(&mut self) {
        self.offline.force(false);
    }

    pub fn clear_force(&mut self) {
        self.offline.clear_force();
    }

    pub fn position(&self) -> Option<(FVal, FVal)> {
        self.pos
    }

    pub fn set_position(&mut self, x: FVal, y: FVal) {
        self.pos = Some((x, y));
    }

    /// Charging load over the last step, kWh/s.
    pub fn charge_load(&self) -> FVal {
        self.charge_load
    }

    pub fn charge_load_kw(&self) -> FVal {
        kwhps_to_kw(self.charge_load)
    }

    pub fn charge_load_mw(&self) -> FVal {
        kwhps_to_mw(self.charge_load)
    }

    /// Discharging load over the last step, kWh/s.
    pub fn discharge_load(&self) -> FVal {
        self.discharge_load
    }

    pub fn discharge_load_kw(&self) -> FVal {
        kwhps_to_kw(self.discharge_load)
    }

    pub fn discharge_load_mw(&self) -> FVal {
        kwhps_to_mw(self.discharge_load)
    }

    /// The V2G capacity computed by the last capacity pass, kWh/s.
    pub fn v2g_cap(&self) -> FVal {
        self.v2g_cap
    }

    pub fn v2g_cap_kw(&self) -> FVal {
        kwhps_to_kw(self.v2g_cap)
    }
}
