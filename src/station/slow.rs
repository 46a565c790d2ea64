use std::sync::Arc;

use crate::col::OrderedSet;
use crate::curve::{StepCurve, TimeWindows};
use crate::error::{Result, SimError};
use crate::market::AllocFn;
use crate::primitives::{FVal, Time};
use crate::station::{Station, StationBase};
use crate::vehicle::{Fleet, VehIdx};

/// A destination-parking station. Charging is gated by each vehicle's
/// willingness predicate; finished vehicles stay parked in the "free" set,
/// where they may sell energy back through the station's allocation strategy.
/// No overflow buffer: a full station rejects immediately.
pub struct SlowStation {
    base: StationBase,
    charging: OrderedSet<VehIdx>,
    free: OrderedSet<VehIdx>,
}

impl SlowStation {
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
        let base = StationBase::new(
            id,
            edge,
            slots,
            bus,
            pos,
            offline,
            total_pc_limit,
            total_pd_limit,
            price_buy,
            price_sell,
            alloc,
        )?;
        Ok(Self {
            base,
            charging: OrderedSet::new(),
            free: OrderedSet::new(),
        })
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl Station for SlowStation {
    fn base(&self) -> &StationBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StationBase {
        &mut self.base
    }

    fn add_veh(&mut self, vid: VehIdx) -> bool {
        if self.has_veh(vid) {
            return false;
        }
        if self.occupancy() < self.base.slots {
            self.charging.insert(vid);
            return true;
        }
        false
    }

    fn pop_veh(&mut self, vid: VehIdx) -> bool {
        self.free.erase(vid) || self.charging.erase(vid)
    }

    fn has_veh(&self, vid: VehIdx) -> bool {
        self.charging.contains(vid) || self.free.contains(vid)
    }

    fn is_charging(&self, vid: VehIdx) -> bool {
        self.charging.contains(vid)
    }

    fn occupancy(&self) -> usize {
        self.charging.len() + self.free.len()
    }

    fn veh_count(&self, only_charging: bool) -> usize {
        if only_charging {
            self.charging.len()
        } else {
            self.occupancy()
        }
    }

    fn update(
        &mut self,
        fleet: &mut Fleet,
        elapsed: Time,
        t: Time,
        v2g_ratio: FVal,
    ) -> Result<Vec<VehIdx>> {
        if !self.base.is_online(t) {
            // Parked vehicles stay plugged in, they just stop drawing.
            self.base.charge_load = 0.0;
            self.base.discharge_load = 0.0;
            return Ok(Vec::new());
        }

        let price = self.base.price_buy_at(t);
        let mut charged = 0.0;
        let mut finished = Vec::new();
        for (i, vid) in self.charging.iter().enumerate() {
            let ev = fleet.veh_mut(vid);
            if ev.can_slow_charge(t, price) {
                charged += ev.charge(elapsed, price, self.base.slot_pc_limit[i].min(ev.pc_slow));
                // While a V2G session runs, stop charging at the V2G floor so
                // the energy stays sellable.
                let stop = if v2g_ratio > 0.0 { ev.k_v2g.min(1.0) } else { 1.0 };
                if ev.batt_elec >= ev.batt_cap * stop {
                    finished.push(vid);
                }
            }
        }
        for &vid in &finished {
            self.charging.erase(vid);
            self.free.insert(vid);
        }

        let mut discharged = 0.0;
        if v2g_ratio > 0.0 {
            let sell = self.base.price_sell_at(t);
            let eligible: Vec<VehIdx> = self
                .free
                .iter()
                .filter(|&vid| fleet.veh(vid).can_v2g(t, sell))
                .collect();
            let allocation = (self.base.alloc)(fleet, &eligible, self.base.v2g_cap, t, v2g_ratio)?;
            if allocation.len() != eligible.len() {
                return Err(SimError::Allocation(format!(
                    "station '{}': strategy returned {} values for {} eligible vehicles",
                    self.base.id,
                    allocation.len(),
                    eligible.len()
                )));
            }
            self.base.pd_actual = allocation;
            for (i, &vid) in eligible.iter().enumerate() {
                discharged += fleet
                    .veh_mut(vid)
                    .discharge(self.base.pd_actual[i], elapsed, sell);
            }
        }

        if elapsed > 0 {
            self.base.charge_load = charged / elapsed as FVal;
            self.base.discharge_load = discharged / elapsed as FVal;
        } else {
            self.base.charge_load = 0.0;
            self.base.discharge_load = 0.0;
        }
        Ok(Vec::new())
    }

    fn v2g_capacity(&mut self, fleet: &Fleet, t: Time) -> FVal {
        if !self.base.is_online(t) {
            return 0.0;
        }
        let sell = self.base.price_sell_at(t);
        let mut total = 0.0;
        for vid in self.charging.iter().chain(self.free.iter()) {
            let ev = fleet.veh(vid);
            if ev.can_v2g(t, sell) {
                total += ev.pd_v2g * ev.eta_d;
            }
        }
        self.base.v2g_cap = total;
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::AllocPool;
    use crate::vehicle::{BattCorrPool, Trip, Vehicle, VehicleParams};

    fn station(slots: usize, alloc: Arc<AllocFn>) -> SlowStation {
        SlowStation::new(
            "s0".into(),
            "e0".into(),
            slots,
            "b0".into(),
            Some((0.0, 0.0)),
            TimeWindows::always(false),
            // 0.004 kWh/s total; sell price flat 2.0, buy 1.0.
            0.004,
            0.004,
            StepCurve::flat(1.0),
            StepCurve::flat(2.0),
            alloc,
        )
        .unwrap()
    }

    fn fleet_of(n: usize, soc: FVal) -> Fleet {
        let pool = BattCorrPool::with_defaults();
        let mut fleet = Fleet::new();
        for i in 0..n {
            let trip = Trip::new(
                format!("t{i}"),
                0,
                String::new(),
                String::new(),
                vec!["a".into(), "b".into()],
                None,
            )
            .unwrap();
            let params = VehicleParams {
                cap_kwh: 10.0,
                soc,
                eta_c: 1.0,
                eta_d: 1.0,
                pc_slow_kw: 3.6,  // 0.001 kWh/s
                pd_v2g_kw: 3.6,   // 0.001 kWh/s
                k_slow: 0.5,
                k_v2g: 0.8,
                ..VehicleParams::default()
            };
            fleet
                .add(
                    Vehicle::new(
                        format!("ev{i}"),
                        vec![trip],
                        params,
                        TimeWindows::always(true),
                        TimeWindows::always(true),
                        pool.get("Equal").unwrap(),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        fleet
    }

    fn avg() -> Arc<AllocFn> {
        AllocPool::with_defaults().get("Average").unwrap()
    }

    #[test]
    fn rejects_when_full_and_on_duplicates() {
        let mut cs = station(2, avg());
        assert!(cs.add_veh(VehIdx(0)));
        assert!(!cs.add_veh(VehIdx(0)));
        assert!(cs.add_veh(VehIdx(1)));
        assert!(!cs.add_veh(VehIdx(2)));
        assert_eq!(cs.occupancy(), 2);
    }

    #[test]
    fn charges_only_willing_vehicles() {
        let mut cs = station(2, avg());
        let mut fleet = fleet_of(2, 0.3);
        // ev1 is above its slow-charge threshold and must not draw.
        fleet.veh_mut(VehIdx(1)).batt_elec = 8.0;
        cs.add_veh(VehIdx(0));
        cs.add_veh(VehIdx(1));
        cs.update(&mut fleet, 100, 0, 0.0).unwrap();
        assert!((fleet.veh(VehIdx(0)).batt_elec - 3.1).abs() < 1e-9);
        assert!((fleet.veh(VehIdx(1)).batt_elec - 8.0).abs() < 1e-9);
        assert!((cs.base().charge_load() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn finished_vehicles_move_to_the_free_set() {
        let mut cs = station(1, avg());
        let mut fleet = fleet_of(1, 0.3);
        fleet.veh_mut(VehIdx(0)).batt_elec = 4.9;
        cs.add_veh(VehIdx(0));
        // Willingness is re-checked each step: once SoC reaches k_slow the
        // vehicle stops drawing but stays in the charging set.
        cs.update(&mut fleet, 100, 0, 0.0).unwrap();
        assert!((fleet.veh(VehIdx(0)).batt_elec - 5.0).abs() < 1e-9);
        assert!(cs.is_charging(VehIdx(0)));
        assert_eq!(cs.free_count(), 0);
    }

    #[test]
    fn v2g_session_discharges_the_free_set() {
        let mut cs = station(2, avg());
        let mut fleet = fleet_of(2, 0.9);
        cs.add_veh(VehIdx(0));
        cs.add_veh(VehIdx(1));
        // Move both to free by hand: they are above k_slow already, so a
        // plain update leaves them in charging (not willing, not finished).
        cs.charging.erase(VehIdx(0));
        cs.charging.erase(VehIdx(1));
        cs.free.insert(VehIdx(0));
        cs.free.insert(VehIdx(1));

        let cap = cs.v2g_capacity(&fleet, 0);
        assert!((cap - 2.0 * 0.001).abs() < 1e-12);

        cs.update(&mut fleet, 100, 0, 0.5).unwrap();
        // Each discharges at ratio 0.5 of 0.001 kWh/s for 100 s.
        assert!((fleet.veh(VehIdx(0)).batt_elec - (9.0 - 0.05)).abs() < 1e-9);
        assert!((fleet.veh(VehIdx(0)).revenue - 0.05 * 2.0).abs() < 1e-9);
        assert!((cs.base().discharge_load() - 0.001).abs() < 1e-12);
        // Power fed to the grid never exceeds the station's V2G capacity.
        assert!(cs.base().discharge_load() <= cap + 1e-12);
        assert_eq!(cs.base().pd_actual.len(), 2);
    }

    #[test]
    fn wrong_sized_allocation_is_fatal_for_the_station() {
        let bad: Arc<AllocFn> = Arc::new(|_fleet, _vids, _cap, _t, _ratio| Ok(vec![0.5]));
        let mut cs = station(2, bad);
        let mut fleet = fleet_of(2, 0.9);
        cs.free.insert(VehIdx(0));
        cs.free.insert(VehIdx(1));
        cs.v2g_capacity(&fleet, 0);
        assert!(matches!(
            cs.update(&mut fleet, 100, 0, 0.5),
            Err(SimError::Allocation(_))
        ));
    }

    #[test]
    fn offline_stops_drawing_without_evicting() {
        let mut cs = station(2, avg());
        let mut fleet = fleet_of(1, 0.3);
        cs.add_veh(VehIdx(0));
        cs.base_mut().force_offline();
        let out = cs.update(&mut fleet, 100, 0, 0.0).unwrap();
        assert!(out.is_empty());
        assert_eq!(cs.occupancy(), 1);
        assert!((fleet.veh(VehIdx(0)).batt_elec - 3.0).abs() < 1e-9);
        assert_eq!(cs.v2g_capacity(&fleet, 0), 0.0);
    }
}
