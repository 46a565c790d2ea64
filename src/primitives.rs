/// Simulated time in seconds.
pub type Time = i64;

/// Floating point value type used throughout the simulation.
pub type FVal = f64;

pub const EPS: FVal = 1e-9;

/// Converts a power given in kW to the internal unit (kWh per second).
pub fn kw_to_kwhps(kw: FVal) -> FVal {
    kw / 3.6e3
}

/// Converts the internal power unit (kWh per second) to kW.
pub fn kwhps_to_kw(p: FVal) -> FVal {
    p * 3.6e3
}

/// Converts the internal power unit (kWh per second) to MW.
pub fn kwhps_to_mw(p: FVal) -> FVal {
    p * 3.6
}
