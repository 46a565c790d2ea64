use crate::col::{map_new, HashMap};
use crate::error::{Result, SimError};
use crate::primitives::{FVal, Time};
use crate::spatial::{KdTree, Point};
use crate::station::{CsIdx, SlowStation, Station};
use crate::vehicle::{Fleet, VehIdx};

/// Indexed collection of stations of one kind.
///
/// Owns the stations; everyone else speaks [CsIdx]. Tracks which station a
/// vehicle is registered at, so a vehicle appears in at most one station's
/// membership across the registry, and holds a kd-tree over the station
/// positions for nearest/k-nearest queries.
pub struct StationRegistry<S: Station> {
    stations: Vec<S>,
    index_by_id: HashMap<String, CsIdx>,
    index_by_edge: HashMap<String, CsIdx>,
    station_of_veh: HashMap<VehIdx, CsIdx>,
    tree: KdTree,
}

impl<S: Station> StationRegistry<S> {
    pub fn new(stations: Vec<S>) -> Result<Self> {
        let mut index_by_id = map_new();
        let mut index_by_edge = map_new();
        for (i, s) in stations.iter().enumerate() {
            let idx = CsIdx(i as u32);
            if index_by_id.insert(s.base().id.clone(), idx).is_some() {
                return Err(SimError::Config(format!("duplicate station id '{}'", s.base().id)));
            }
            // First station on an edge wins; destination joins go there.
            index_by_edge.entry(s.base().edge.clone()).or_insert(idx);
        }
        let mut registry = Self {
            stations,
            index_by_id,
            index_by_edge,
            station_of_veh: map_new(),
            tree: KdTree::new(),
        };
        if registry.positions_known() {
            registry.rebuild_tree();
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn station(&self, idx: CsIdx) -> &S {
        &self.stations[idx.0 as usize]
    }

    pub fn station_mut(&mut self, idx: CsIdx) -> &mut S {
        &mut self.stations[idx.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.stations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut S> {
        self.stations.iter_mut()
    }

    pub fn indices(&self) -> impl Iterator<Item = CsIdx> {
        (0..self.stations.len() as u32).map(CsIdx)
    }

    pub fn ids(&self) -> Vec<String> {
        self.stations.iter().map(|s| s.base().id.clone()).collect()
    }

    pub fn index_of(&self, id: &str) -> Option<CsIdx> {
        self.index_by_id.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Result<&S> {
        self.index_of(id)
            .map(|idx| self.station(idx))
            .ok_or_else(|| SimError::NotFound(format!("station '{id}'")))
    }

    /// The station serving an edge, if any.
    pub fn index_at_edge(&self, edge: &str) -> Option<CsIdx> {
        self.index_by_edge.get(edge).copied()
    }

    pub fn positions_known(&self) -> bool {
        self.stations.iter().all(|s| s.base().position().is_some())
    }

    pub fn tree_ready(&self) -> bool {
        self.tree.is_built()
    }

    /// Rebuilds the spatial index from the current station positions.
    /// Stations without a position are silently left out.
    pub fn rebuild_tree(&mut self) {
        let points = self
            .stations
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.base().position().map(|(x, y)| Point::new(x, y, i as u32))
            })
            .collect();
        self.tree.build(points);
    }

    /// The k nearest stations to (x, y) by squared euclidean distance, or
    /// None when the index cannot answer (not built, or k is not smaller
    /// than the station count); callers then fall back to a linear scan.
    pub fn select_near(&self, x: FVal, y: FVal, k: usize) -> Option<Vec<CsIdx>> {
        if !self.tree.is_built() || k >= self.stations.len() {
            return None;
        }
        Some(
            self.tree
                .k_nearest(x, y, k)
                .into_iter()
                .map(|p| CsIdx(p.label))
                .collect(),
        )
    }

    /// The single nearest station, if the index is built.
    pub fn nearest(&self, x: FVal, y: FVal) -> Option<CsIdx> {
        self.tree.nearest(x, y).map(|p| CsIdx(p.label))
    }

    /// Registers a vehicle with the given station and records the membership.
    pub fn add_veh(&mut self, vid: VehIdx, cs: CsIdx) -> bool {
        if self.stations[cs.0 as usize].add_veh(vid) {
            self.station_of_veh.insert(vid, cs);
            return true;
        }
        false
    }

    /// Removes a vehicle from whichever station holds it.
    pub fn pop_veh(&mut self, vid: VehIdx) -> bool {
        if let Some(cs) = self.station_of_veh.remove(&vid) {
            self.stations[cs.0 as usize].pop_veh(vid);
            return true;
        }
        false
    }

    pub fn has_veh(&self, vid: VehIdx) -> bool {
        self.station_of_veh.contains_key(&vid)
    }

    pub fn is_charging(&self, vid: VehIdx) -> bool {
        self.station_of_veh
            .get(&vid)
            .is_some_and(|cs| self.stations[cs.0 as usize].is_charging(vid))
    }

    pub fn station_of(&self, vid: VehIdx) -> Option<CsIdx> {
        self.station_of_veh.get(&vid).copied()
    }

    pub fn veh_counts(&self) -> Vec<usize> {
        self.stations.iter().map(|s| s.veh_count(false)).collect()
    }
}

/// The slow-station registry plus the per-station V2G market state: cached
/// capacities, externally supplied demands, and the resulting ratios.
pub struct SlowRegistry {
    inner: StationRegistry<SlowStation>,
    v2g_cap: Vec<FVal>,
    v2g_demand: Vec<FVal>,
    v2g_ratio: Vec<FVal>,
    cap_time: Option<Time>,
}

impl SlowRegistry {
    pub fn new(stations: Vec<SlowStation>) -> Result<Self> {
        let inner = StationRegistry::new(stations)?;
        let n = inner.len();
        Ok(Self {
            inner,
            v2g_cap: vec![0.0; n],
            v2g_demand: vec![0.0; n],
            v2g_ratio: vec![0.0; n],
            cap_time: None,
        })
    }

    pub fn stations(&self) -> &StationRegistry<SlowStation> {
        &self.inner
    }

    pub fn stations_mut(&mut self) -> &mut StationRegistry<SlowStation> {
        &mut self.inner
    }

    /// Recomputes every station's V2G capacity, at most once per time point.
    pub fn refresh_v2g_capacities(&mut self, fleet: &Fleet, t: Time) {
        if self.cap_time == Some(t) {
            return;
        }
        for i in 0..self.inner.len() {
            self.v2g_cap[i] = self.inner.station_mut(CsIdx(i as u32)).v2g_capacity(fleet, t);
        }
        self.cap_time = Some(t);
    }

    pub fn v2g_capacities(&mut self, fleet: &Fleet, t: Time) -> &[FVal] {
        self.refresh_v2g_capacities(fleet, t);
        &self.v2g_cap
    }

    /// Sets the grid-side discharge demand for one station, kWh/s. The value
    /// persists until changed or cleared.
    pub fn set_v2g_demand(&mut self, cs: CsIdx, demand: FVal) {
        self.v2g_demand[cs.0 as usize] = demand;
    }

    pub fn clear_v2g_demand(&mut self) {
        self.v2g_demand.fill(0.0);
    }

    pub fn v2g_ratios(&self) -> &[FVal] {
        &self.v2g_ratio
    }

    /// Runs one step for every slow station: derives each station's market
    /// ratio from demand over capacity, then updates the station. Returns
    /// (station, vehicle) pairs for vehicles that left service.
    pub fn update_all(
        &mut self,
        fleet: &mut Fleet,
        elapsed: Time,
        t: Time,
    ) -> Result<Vec<(CsIdx, VehIdx)>> {
        self.refresh_v2g_capacities(fleet, t);
        for i in 0..self.inner.len() {
            self.v2g_ratio[i] = if self.v2g_cap[i] > 0.0 {
                (self.v2g_demand[i] / self.v2g_cap[i]).min(1.0)
            } else {
                0.0
            };
        }
        let mut left = Vec::new();
        for i in 0..self.inner.len() {
            let cs = CsIdx(i as u32);
            let ratio = self.v2g_ratio[i];
            let out = self.inner.station_mut(cs).update(fleet, elapsed, t, ratio)?;
            for vid in out {
                self.inner.pop_veh(vid);
                left.push((cs, vid));
            }
        }
        Ok(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{StepCurve, TimeWindows};
    use crate::market::AllocPool;
    use crate::station::FastStation;

    fn fast(id: &str, edge: &str, x: FVal, y: FVal) -> FastStation {
        FastStation::new(
            id.into(),
            edge.into(),
            2,
            "b".into(),
            Some((x, y)),
            TimeWindows::always(false),
            0.02,
            StepCurve::flat(1.0),
            AllocPool::with_defaults().get("").unwrap(),
        )
        .unwrap()
    }

    fn registry() -> StationRegistry<FastStation> {
        StationRegistry::new(vec![
            fast("f0", "e0", 0.0, 0.0),
            fast("f1", "e1", 100.0, 0.0),
            fast("f2", "e2", 0.0, 100.0),
        ])
        .unwrap()
    }

    #[test]
    fn indexes_by_id_and_edge() {
        let reg = registry();
        assert_eq!(reg.index_of("f1"), Some(CsIdx(1)));
        assert_eq!(reg.index_of("f9"), None);
        assert!(reg.get("f9").is_err());
        assert_eq!(reg.index_at_edge("e2"), Some(CsIdx(2)));
        assert!(StationRegistry::new(vec![fast("dup", "a", 0.0, 0.0), fast("dup", "b", 1.0, 1.0)]).is_err());
    }

    #[test]
    fn vehicle_membership_is_exclusive() {
        let mut reg = registry();
        assert!(reg.add_veh(VehIdx(7), CsIdx(0)));
        assert!(reg.has_veh(VehIdx(7)));
        assert!(reg.is_charging(VehIdx(7)));
        assert_eq!(reg.station_of(VehIdx(7)), Some(CsIdx(0)));
        // The same vehicle is rejected by its own station on re-add.
        assert!(!reg.add_veh(VehIdx(7), CsIdx(0)));
        assert!(reg.pop_veh(VehIdx(7)));
        assert!(!reg.pop_veh(VehIdx(7)));
        assert!(!reg.has_veh(VehIdx(7)));
        assert!(reg.add_veh(VehIdx(7), CsIdx(1)));
        assert_eq!(reg.station_of(VehIdx(7)), Some(CsIdx(1)));
    }

    #[test]
    fn spatial_queries_with_linear_fallback() {
        let reg = registry();
        assert!(reg.tree_ready());
        assert_eq!(reg.nearest(90.0, 10.0), Some(CsIdx(1)));
        let near = reg.select_near(1.0, 0.5, 2).unwrap();
        assert_eq!(near, vec![CsIdx(0), CsIdx(1)]);
        // k not smaller than the station count -> caller must scan.
        assert_eq!(reg.select_near(0.0, 0.0, 3), None);
    }

    #[test]
    fn tree_stays_unbuilt_until_positions_resolve() {
        let no_pos = FastStation::new(
            "g1".into(),
            "e1".into(),
            1,
            "b".into(),
            None,
            TimeWindows::always(false),
            0.01,
            StepCurve::flat(1.0),
            AllocPool::with_defaults().get("").unwrap(),
        )
        .unwrap();
        let mut reg = StationRegistry::new(vec![fast("g0", "e0", 0.0, 0.0), no_pos]).unwrap();
        assert!(!reg.tree_ready());
        assert_eq!(reg.select_near(0.0, 0.0, 1), None);

        reg.station_mut(CsIdx(1)).base_mut().set_position(50.0, 50.0);
        assert!(reg.positions_known());
        reg.rebuild_tree();
        assert!(reg.tree_ready());
        assert_eq!(reg.nearest(49.0, 49.0), Some(CsIdx(1)));
    }
}
