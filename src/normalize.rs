//! Smoothing of transient invalid sensor readings.
//!
//! Fans occasionally report placeholder values (`"-"`, `"0"`, `"100"`) for a poll or
//! two. Those are replaced by the last good value seen for the same device and metric.

use log::debug;
use std::collections::BTreeMap;

use crate::models::marshydro::{Device, DeviceId, DeviceKind, Reading};

pub const INVALID_READINGS: &[&str] = &["-", "0", "100", ""];

/// Returns `(clean, updated_last_good)`.
///
/// A sentinel reading yields the previous last-good value for both; any other
/// reading becomes the new last-good value.
pub fn normalize(reading: Reading, sentinels: &[&str], last_good: Option<Reading>) -> (Option<Reading>, Option<Reading>) {
    if sentinels.contains(&reading.as_str().trim()) {
        (last_good.clone(), last_good)
    } else {
        (Some(reading.clone()), Some(reading))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct LastGood {
    temperature: Option<Reading>,
    humidity: Option<Reading>,
}

/// Last-known-good readings, tracked per device.
#[derive(Debug, Default)]
pub struct NormalizerState {
    sentinels: Vec<String>,
    per_device: BTreeMap<DeviceId, LastGood>,
}

impl NormalizerState {
    pub fn new() -> Self {
        NormalizerState::with_sentinels(INVALID_READINGS)
    }

    pub fn with_sentinels(sentinels: &[&str]) -> Self {
        NormalizerState {
            sentinels: sentinels.iter().map(|s| s.to_string()).collect(),
            per_device: BTreeMap::new(),
        }
    }

    /// Cleans the fan readings of `device` in place. Other kinds pass through untouched.
    pub fn apply(&mut self, device: &mut Device) {
        let DeviceKind::Fan(fan) = &mut device.kind else {
            return;
        };
        let sentinels: Vec<&str> = self.sentinels.iter().map(String::as_str).collect();
        let memory = self.per_device.entry(device.id).or_default();

        for (label, slot, last) in [
            ("temperature", &mut fan.temperature, &mut memory.temperature),
            ("humidity", &mut fan.humidity, &mut memory.humidity),
        ] {
            // a missing reading is as useless as a sentinel
            let reading = slot.take().unwrap_or_else(|| Reading(String::new()));
            let raw = reading.clone();
            let (clean, updated) = normalize(reading, &sentinels, last.take());
            if clean.as_ref() != Some(&raw) {
                debug!("Device {}: replaced {} reading {:?} with {:?}", device.id, label, raw.as_str(), clean);
            }
            *slot = clean;
            *last = updated;
        }
    }

    pub fn forget(&mut self, id: DeviceId) {
        self.per_device.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::marshydro::{FanState, ProductType};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn fan(id: i64, temperature: Option<&str>, humidity: Option<&str>) -> Device {
        Device {
            id: DeviceId(id),
            name: format!("fan {}", id),
            product_type: ProductType::Wind,
            serial: None,
            version: None,
            image: None,
            connected: Some(true),
            kind: DeviceKind::Fan(FanState {
                is_close: false,
                speed_rate: None,
                speed: None,
                temperature: temperature.map(Reading::from),
                humidity: humidity.map(Reading::from),
            }),
        }
    }

    fn temp(d: &Device) -> Option<&str> {
        d.as_fan().and_then(|f| f.temperature.as_ref()).map(Reading::as_str)
    }

    fn hum(d: &Device) -> Option<&str> {
        d.as_fan().and_then(|f| f.humidity.as_ref()).map(Reading::as_str)
    }

    #[test]
    fn sentinels_keep_last_good() {
        let mut rng = SmallRng::seed_from_u64(0x4d41_5253);
        for _ in 0..500 {
            let r = INVALID_READINGS[rng.random_range(0..INVALID_READINGS.len())];
            let last = if rng.random_bool(0.2) {
                None
            } else {
                Some(Reading(rng.random_range(1..100u32).to_string()))
            };
            let (clean, updated) = normalize(Reading::from(r), INVALID_READINGS, last.clone());
            assert_eq!(clean, last);
            assert_eq!(updated, last);
        }
    }

    #[test]
    fn valid_readings_replace_last_good() {
        let mut rng = SmallRng::seed_from_u64(0x4859_4452);
        for _ in 0..500 {
            let value = format!("{:.1}", rng.random_range(0.5..99.5f64));
            if INVALID_READINGS.contains(&value.as_str()) {
                continue;
            }
            let r = Reading(value);
            let last = Some(Reading::from("42"));
            let (clean, updated) = normalize(r.clone(), INVALID_READINGS, last);
            assert_eq!(clean, Some(r.clone()));
            assert_eq!(updated, Some(r));
        }
    }

    #[test]
    fn state_is_tracked_per_device_and_metric() {
        let mut state = NormalizerState::new();

        let mut a = fan(1, Some("70"), Some("45"));
        let mut b = fan(2, Some("80"), Some("60"));
        state.apply(&mut a);
        state.apply(&mut b);

        let mut a2 = fan(1, Some("-"), Some("47"));
        let mut b2 = fan(2, Some("81"), Some("100"));
        state.apply(&mut a2);
        state.apply(&mut b2);

        assert_eq!(temp(&a2), Some("70"));
        assert_eq!(hum(&a2), Some("47"));
        assert_eq!(temp(&b2), Some("81"));
        assert_eq!(hum(&b2), Some("60"));
    }

    #[test]
    fn missing_reading_uses_last_good() {
        let mut state = NormalizerState::new();
        state.apply(&mut fan(3, Some("72"), Some("50")));
        let mut next = fan(3, None, None);
        state.apply(&mut next);
        assert_eq!(temp(&next), Some("72"));
        assert_eq!(hum(&next), Some("50"));
    }

    #[test]
    fn first_invalid_reading_stays_empty() {
        let mut state = NormalizerState::new();
        let mut d = fan(4, Some("0"), Some("-"));
        state.apply(&mut d);
        assert_eq!(temp(&d), None);
        assert_eq!(hum(&d), None);
    }

    #[test]
    fn forget_drops_device_memory() {
        let mut state = NormalizerState::new();
        state.apply(&mut fan(5, Some("70"), Some("40")));
        state.forget(DeviceId(5));
        let mut d = fan(5, Some("-"), Some("-"));
        state.apply(&mut d);
        assert_eq!(temp(&d), None);
    }
}
