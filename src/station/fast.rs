use std::sync::Arc;

use crate::col::OrderedSet;
use crate::curve::{StepCurve, TimeWindows};
use crate::error::Result;
use crate::market::AllocFn;
use crate::primitives::{FVal, Time};
use crate::station::{Station, StationBase};
use crate::vehicle::{Fleet, VehIdx};

/// A high-power opportunity-charging station. No V2G. Vehicles beyond the
/// slot count wait in a FIFO overflow buffer and are promoted as slots free
/// up; capacity never rejects an admission.
pub struct FastStation {
    base: StationBase,
    charging: OrderedSet<VehIdx>,
    buffer: OrderedSet<VehIdx>,
}

impl FastStation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        edge: String,
        slots: usize,
        bus: String,
        pos: Option<(FVal, FVal)>,
        offline: TimeWindows,
        total_pc_limit: FVal,
        price_buy: StepCurve,
        alloc_placeholder: Arc<AllocFn>,
    ) -> Result<Self> {
        let base = StationBase::new(
            id,
            edge,
            slots,
            bus,
            pos,
            offline,
            total_pc_limit,
            0.0,
            price_buy,
            StepCurve::empty(),
            alloc_placeholder,
        )?;
        Ok(Self {
            base,
            charging: OrderedSet::new(),
            buffer: OrderedSet::new(),
        })
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }
}

impl Station for FastStation {
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
        if self.charging.len() < self.base.slots {
            self.charging.insert(vid);
        } else {
            self.buffer.insert(vid);
        }
        true
    }

    fn pop_veh(&mut self, vid: VehIdx) -> bool {
        self.charging.erase(vid) || self.buffer.erase(vid)
    }

    fn has_veh(&self, vid: VehIdx) -> bool {
        self.charging.contains(vid) || self.buffer.contains(vid)
    }

    fn is_charging(&self, vid: VehIdx) -> bool {
        self.charging.contains(vid)
    }

    fn occupancy(&self) -> usize {
        self.charging.len() + self.buffer.len()
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
        _v2g_ratio: FVal,
    ) -> Result<Vec<VehIdx>> {
        if !self.base.is_online(t) {
            // An offline fast station drops everyone, charging and buffered;
            // the orchestrator redirects them.
            self.base.charge_load = 0.0;
            let mut evicted: Vec<VehIdx> = self.charging.iter().collect();
            evicted.extend(self.buffer.iter());
            self.charging.clear();
            self.buffer.clear();
            return Ok(evicted);
        }

        let price = self.base.price_buy_at(t);
        let mut energy = 0.0;
        let mut full = Vec::new();
        for (i, vid) in self.charging.iter().enumerate() {
            let ev = fleet.veh_mut(vid);
            energy += ev.charge(elapsed, price, self.base.slot_pc_limit[i].min(ev.pc_fast));
            if ev.batt_elec >= ev.batt_cap {
                full.push(vid);
            }
        }
        for &vid in &full {
            self.charging.erase(vid);
            if let Some(next) = self.buffer.pop_front() {
                self.charging.insert(next);
            }
        }
        self.base.charge_load = if elapsed > 0 { energy / elapsed as FVal } else { 0.0 };
        Ok(full)
    }

    fn v2g_capacity(&mut self, _fleet: &Fleet, _t: Time) -> FVal {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::AllocPool;
    use crate::vehicle::{BattCorrPool, Trip, Vehicle, VehicleParams};
    use itertools::Itertools;

    fn station(slots: usize) -> FastStation {
        FastStation::new(
            "f0".into(),
            "e0".into(),
            slots,
            "b0".into(),
            Some((0.0, 0.0)),
            TimeWindows::always(false),
            // 0.02 kWh/s total.
            0.02,
            StepCurve::flat(1.5),
            AllocPool::with_defaults().get("").unwrap(),
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
                pc_fast_kw: 36.0, // 0.01 kWh/s
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

    #[test]
    fn overflow_lands_in_the_buffer() {
        let mut cs = station(2);
        for i in 0..4 {
            assert!(cs.add_veh(VehIdx(i)));
        }
        assert!(!cs.add_veh(VehIdx(0)));
        assert_eq!(cs.veh_count(true), 2);
        assert_eq!(cs.occupancy(), 4);
        assert_eq!(cs.buffered_count(), 2);
        assert!(cs.is_charging(VehIdx(0)));
        assert!(!cs.is_charging(VehIdx(2)));
    }

    #[test]
    fn finished_vehicles_are_replaced_fifo() {
        let mut cs = station(1);
        let mut fleet = fleet_of(3, 0.5);
        for i in 0..3 {
            cs.add_veh(VehIdx(i));
        }
        // 5 kWh to full at 0.01 kWh/s (slot limit 0.02, vehicle 0.01).
        let full = cs.update(&mut fleet, 499, 0, 0.0).unwrap();
        assert!(full.is_empty());
        let full = cs.update(&mut fleet, 1, 499, 0.0).unwrap();
        assert_eq!(full, vec![VehIdx(0)]);
        assert!(cs.is_charging(VehIdx(1)));
        assert!(!cs.is_charging(VehIdx(2)));
        assert_eq!(cs.buffered_count(), 1);
        // The charging set never exceeds the slot count.
        assert!(cs.veh_count(true) <= 1);
    }

    #[test]
    fn charge_respects_the_slot_limit_and_accrues_load() {
        let mut cs = station(2);
        let mut fleet = fleet_of(2, 0.5);
        cs.add_veh(VehIdx(0));
        cs.add_veh(VehIdx(1));
        cs.update(&mut fleet, 100, 0, 0.0).unwrap();
        // Each vehicle takes min(0.01 slot share, 0.01 fast) = 0.01 kWh/s.
        assert!((fleet.veh(VehIdx(0)).batt_elec - 6.0).abs() < 1e-9);
        assert!((cs.base().charge_load() - 0.02).abs() < 1e-12);
        assert!((fleet.veh(VehIdx(0)).cost - 1.0 * 1.5).abs() < 1e-9);
    }

    #[test]
    fn offline_evicts_everyone_in_order() {
        let mut cs = station(1);
        let mut fleet = fleet_of(3, 0.5);
        for i in 0..3 {
            cs.add_veh(VehIdx(i));
        }
        cs.base_mut().force_offline();
        let evicted = cs.update(&mut fleet, 10, 0, 0.0).unwrap();
        assert_eq!(evicted.iter().copied().collect_vec(), vec![VehIdx(0), VehIdx(1), VehIdx(2)]);
        assert_eq!(cs.occupancy(), 0);
        assert_eq!(cs.base().charge_load(), 0.0);
    }
}
