use std::collections::HashMap;

use crate::config::MeterConfig;
use crate::models::{PublishedReading, RawReading};

/// Applies a digit mask like `#####.###` to a raw counter.
///
/// The value is zero padded to the number of `#` and the decimal point is
/// placed as many digits from the right as there are `#` after the `.` in
/// the mask. Longer values are kept whole.
pub fn format_reading(raw_value: u64, mask: Option<&str>) -> String {
    let digits = raw_value.to_string();
    let Some(mask) = mask else {
        return digits;
    };

    let width = mask.chars().filter(|c| *c == '#').count();
    let fraction = match mask.split_once('.') {
        Some((_, after)) => after.chars().filter(|c| *c == '#').count(),
        None => 0,
    };

    let padded = format!("{:0>width$}", digits, width = width);
    if fraction == 0 {
        return padded;
    }

    let split = padded.len() - fraction;
    return format!("{}.{}", &padded[..split], &padded[split..]);
}

/// Formats the readings of a finished cycle in configuration order.
/// Meters without a reading (timed out cycles) are left out.
pub fn prepare_readings(latest: &HashMap<String, RawReading>, meters: &[MeterConfig]) -> Vec<PublishedReading> {
    let mut prepared = Vec::new();
    for meter in meters {
        if let Some(reading) = latest.get(&meter.id) {
            prepared.push(PublishedReading {
                meter_id: meter.id.clone(),
                formatted_value: format_reading(reading.raw_value, meter.format.as_deref()),
                config: meter.clone(),
            });
        }
    }
    return prepared;
}
