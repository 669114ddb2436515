//! Sensor data validation. Pure predicates applied before a reading is
//! trusted anywhere downstream.

pub fn is_valid_ec(value: Option<f64>) -> bool {
    match value {
        Some(v) if v.is_finite() => (0.01..=3.0).contains(&v),
        _ => false,
    }
}

pub fn is_valid_ph(value: Option<f64>) -> bool {
    match value {
        Some(v) if v.is_finite() => (4.0..=9.0).contains(&v),
        _ => false,
    }
}

pub fn is_valid_water_level(value: Option<f64>) -> bool {
    match value {
        Some(v) if v.is_finite() => (0.0..=100.0).contains(&v),
        _ => false,
    }
}
