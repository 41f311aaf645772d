//! Thin host probes consumed by `status_excavator`.

/// CPU temperature [°C] from the first thermal zone, if readable.
pub fn cpu_temperature() -> Option<f64> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    let millideg: f64 = raw.trim().parse().ok()?;
    Some(millideg / 1000.0)
}
