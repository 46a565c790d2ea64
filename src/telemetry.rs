use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::warn;

use crate::error::Result;
use crate::primitives::{FVal, Time};
use crate::station::{FastStation, SlowRegistry, Station, StationRegistry};
use crate::vehicle::{Fleet, Vehicle};

/// Outcome of a trip arrival, as recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    NoCharge = 0,
    ChargeOk = 1,
    ChargeFailed = 2,
}

/// Pipe-separated lifecycle event log.
///
/// One record per event, tagged by a short code. Write failures are warned
/// about and swallowed; the sink must never affect simulation state.
pub struct TripLog {
    w: csv::Writer<Box<dyn Write + Send>>,
}

impl TripLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(sink: Box<dyn Write + Send>) -> Self {
        let w = csv::WriterBuilder::new()
            .delimiter(b'|')
            .flexible(true)
            .has_headers(false)
            .from_writer(sink);
        Self { w }
    }

    fn put(&mut self, fields: &[String]) {
        if let Err(e) = self.w.write_record(fields) {
            warn!("trip log write failed: {e}");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.w.flush() {
            warn!("trip log flush failed: {e}");
        }
    }

    pub fn arrive(&mut self, t: Time, ev: &Vehicle, status: Arrival) {
        let next = if ev.trip_idx() + 1 < ev.trips_count() {
            ev.trip_at(ev.trip_idx() + 1).describe()
        } else {
            "None".to_string()
        };
        self.put(&[
            t.to_string(),
            "A".into(),
            ev.brief(),
            (status as i32).to_string(),
            ev.current_trip().to_edge().to_string(),
            next,
        ]);
    }

    pub fn arrive_fast(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[t.to_string(), "AC".into(), ev.brief(), cs.to_string()]);
    }

    pub fn depart(&mut self, t: Time, ev: &Vehicle, delay: Time, cs: Option<&str>) {
        self.put(&[
            t.to_string(),
            "D".into(),
            ev.brief(),
            ev.current_trip().describe(),
            delay.to_string(),
            cs.unwrap_or("None").to_string(),
        ]);
    }

    pub fn depart_delayed(&mut self, t: Time, ev: &Vehicle, delay: Time) {
        self.put(&[
            t.to_string(),
            "DD".into(),
            ev.brief(),
            format!("{:.6}", ev.batt_elec),
            delay.to_string(),
        ]);
    }

    pub fn depart_fast(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[
            t.to_string(),
            "DC".into(),
            ev.brief(),
            cs.to_string(),
            ev.current_trip().to_edge().to_string(),
        ]);
    }

    pub fn depart_failed(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[
            t.to_string(),
            "DF".into(),
            ev.brief(),
            format!("{:.6}", ev.batt_elec),
            cs.to_string(),
        ]);
    }

    pub fn fault_deplete(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[t.to_string(), "FD".into(), ev.brief(), cs.to_string()]);
    }

    pub fn fault_nocharge(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[
            t.to_string(),
            "FN".into(),
            ev.brief(),
            format!("{:.6}", ev.batt_elec),
            cs.to_string(),
        ]);
    }

    pub fn fault_redirect(&mut self, t: Time, ev: &Vehicle, cs_old: &str, cs_new: &str) {
        self.put(&[
            t.to_string(),
            "FR".into(),
            ev.brief(),
            format!("{:.6}", ev.batt_elec),
            cs_old.to_string(),
            cs_new.to_string(),
        ]);
    }

    pub fn join_slow(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[t.to_string(), "SC".into(), ev.brief(), cs.to_string()]);
    }

    pub fn leave_slow(&mut self, t: Time, ev: &Vehicle, cs: &str) {
        self.put(&[t.to_string(), "SL".into(), ev.brief(), cs.to_string()]);
    }
}

/// Change-compressed numeric snapshot writer: one (time, item, value) row per
/// item whose value moved since the last snapshot.
pub struct SnapshotWriter {
    w: csv::Writer<Box<dyn Write + Send>>,
    items: Vec<String>,
    last: Vec<FVal>,
}

const SNAPSHOT_TOLERANCE: FVal = 0.5e-6;

impl SnapshotWriter {
    pub fn create(path: &Path, items: Vec<String>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(Box::new(file), items))
    }

    pub fn from_writer(sink: Box<dyn Write + Send>, items: Vec<String>) -> Self {
        let mut w = csv::Writer::from_writer(sink);
        if let Err(e) = w.write_record(["time", "item", "value"]) {
            warn!("snapshot header write failed: {e}");
        }
        Self {
            w,
            items,
            last: Vec::new(),
        }
    }

    pub fn record(&mut self, t: Time, values: &[FVal]) {
        if values.len() != self.items.len() {
            warn!(
                "snapshot got {} values but has {} items; record dropped",
                values.len(),
                self.items.len()
            );
            return;
        }
        for (i, &v) in values.iter().enumerate() {
            if self.last.is_empty() || (v - self.last[i]).abs() > SNAPSHOT_TOLERANCE {
                if let Err(e) = self.w.write_record(&[
                    t.to_string(),
                    self.items[i].clone(),
                    format!("{v:.6}"),
                ]) {
                    warn!("snapshot write failed: {e}");
                }
            }
        }
        self.last = values.to_vec();
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.w.flush() {
            warn!("snapshot flush failed: {e}");
        }
    }
}

/// `[a1, a2] x [b1, b2] -> ["a1#b1", "a1#b2", "a2#b1", "a2#b2"]`.
pub fn cross_list(names: &[String], attrs: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(names.len() * attrs.len());
    for n in names {
        for a in attrs {
            out.push(format!("{n}#{a}"));
        }
    }
    out
}

const FAST_ATTRS: [&str; 3] = ["cnt", "c", "pb"];
const SLOW_ATTRS: [&str; 6] = ["cnt", "c", "d", "v2g", "pb", "ps"];
const EV_ATTRS: [&str; 4] = ["soc", "status", "cost", "earn"];

pub fn fast_snapshot_items(reg: &StationRegistry<FastStation>) -> Vec<String> {
    cross_list(&reg.ids(), &FAST_ATTRS)
}

pub fn fast_snapshot_values(reg: &StationRegistry<FastStation>, t: Time) -> Vec<FVal> {
    let mut out = Vec::with_capacity(reg.len() * FAST_ATTRS.len());
    for cs in reg.iter() {
        out.push(cs.veh_count(false) as FVal);
        out.push(cs.base().charge_load_kw());
        out.push(cs.base().price_buy_at(t));
    }
    out
}

pub fn slow_snapshot_items(reg: &SlowRegistry) -> Vec<String> {
    cross_list(&reg.stations().ids(), &SLOW_ATTRS)
}

pub fn slow_snapshot_values(reg: &SlowRegistry, t: Time) -> Vec<FVal> {
    let stations = reg.stations();
    let mut out = Vec::with_capacity(stations.len() * SLOW_ATTRS.len());
    for cs in stations.iter() {
        out.push(cs.veh_count(false) as FVal);
        out.push(cs.base().charge_load_kw());
        out.push(cs.base().discharge_load_kw());
        out.push(cs.base().v2g_cap_kw());
        out.push(cs.base().price_buy_at(t));
        out.push(cs.base().price_sell_at(t));
    }
    out
}

pub fn ev_snapshot_items(fleet: &Fleet) -> Vec<String> {
    let names: Vec<String> = fleet.iter().map(|v| v.id.clone()).collect();
    cross_list(&names, &EV_ATTRS)
}

pub fn ev_snapshot_values(fleet: &Fleet) -> Vec<FVal> {
    let mut out = Vec::with_capacity(fleet.len() * EV_ATTRS.len());
    for v in fleet.iter() {
        out.push(v.soc());
        out.push(v.status.code() as FVal);
        out.push(v.cost);
        out.push(v.revenue);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn snapshot_writes_only_changes() {
        let buf = SharedBuf::default();
        let mut w = SnapshotWriter::from_writer(
            Box::new(buf.clone()),
            vec!["a#x".into(), "b#x".into()],
        );
        w.record(0, &[1.0, 2.0]);
        w.record(10, &[1.0, 3.0]);
        w.record(20, &[1.0, 3.0]);
        w.flush();
        let text = buf.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "time,item,value",
                "0,a#x,1.000000",
                "0,b#x,2.000000",
                "10,b#x,3.000000",
            ]
        );
    }

    #[test]
    fn snapshot_drops_wrong_sized_records() {
        let buf = SharedBuf::default();
        let mut w = SnapshotWriter::from_writer(Box::new(buf.clone()), vec!["a".into()]);
        w.record(0, &[1.0, 2.0]);
        w.flush();
        assert_eq!(buf.contents().lines().count(), 1);
    }

    #[test]
    fn cross_list_orders_station_major() {
        let out = cross_list(&["s1".into(), "s2".into()], &["a", "b"]);
        assert_eq!(out, vec!["s1#a", "s1#b", "s2#a", "s2#b"]);
    }
}
