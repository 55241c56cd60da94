//! GATT model and sensor target selection
//!
//! The EMG sensor advertises one primary service and one notifiable
//! characteristic. Many peripherals mislabel their UUIDs, so selection degrades
//! through three tiers instead of failing outright.

use uuid::Uuid;

/// Primary service of the EMG sensor
pub const UUID_SENSOR_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345678);

/// Notifiable characteristic carrying the EMG stream
pub const UUID_SENSOR_CHARACTERISTIC: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_678987654321);

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub notifiable: bool,
}

/// A service as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// How a service/characteristic was matched against the configured target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchTier {
    Exact,
    Partial,
    FirstAvailable,
}

/// The service/characteristic pair chosen for streaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub notifiable: bool,
    /// Weakest tier used for either half of the selection
    pub tier: MatchTier,
}

/// UUIDs to look for on a connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetUuids {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Default for TargetUuids {
    fn default() -> Self {
        Self {
            service: UUID_SENSOR_SERVICE,
            characteristic: UUID_SENSOR_CHARACTERISTIC,
        }
    }
}

// Leading 32-bit group of a UUID, which is what vendors usually keep intact
fn leading_group(uuid: &Uuid) -> String {
    uuid.simple().to_string()[..8].to_string()
}

fn match_tier(candidate: &Uuid, target: &Uuid) -> Option<MatchTier> {
    if candidate == target {
        return Some(MatchTier::Exact);
    }
    let candidate_str = candidate.simple().to_string();
    let target_str = target.simple().to_string();
    if candidate_str.contains(&leading_group(target)) || target_str.contains(&leading_group(candidate)) {
        Some(MatchTier::Partial)
    } else {
        None
    }
}

fn select_characteristic<'a>(
    characteristics: &'a [GattCharacteristic],
    target: &Uuid,
) -> Option<(&'a GattCharacteristic, MatchTier)> {
    let mut best: Option<(&'a GattCharacteristic, MatchTier)> = None;
    for c in characteristics {
        if let Some(tier) = match_tier(&c.uuid, target) {
            if best.map_or(true, |(_, current)| tier < current) {
                best = Some((c, tier));
            }
        }
    }
    best.or_else(|| {
        characteristics
            .iter()
            .find(|c| c.notifiable)
            .or_else(|| characteristics.first())
            .map(|c| (c, MatchTier::FirstAvailable))
    })
}

/// Choose the service and characteristic to stream from
///
/// Services are tried best tier first (exact, partial, then discovery order);
/// the first one holding any characteristic wins. Returns `None` only when no
/// service exposes a characteristic at all.
pub fn select_target(services: &[GattService], target: &TargetUuids) -> Option<SelectedTarget> {
    let mut ranked: Vec<(usize, MatchTier)> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (i, match_tier(&s.uuid, &target.service).unwrap_or(MatchTier::FirstAvailable)))
        .collect();
    ranked.sort_by_key(|&(i, tier)| (tier, i));

    ranked.into_iter().find_map(|(i, service_tier)| {
        let service = &services[i];
        select_characteristic(&service.characteristics, &target.characteristic).map(|(c, char_tier)| {
            SelectedTarget {
                service: service.uuid,
                characteristic: c.uuid,
                notifiable: c.notifiable,
                tier: service_tier.max(char_tier),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(uuid: Uuid, notifiable: bool) -> GattCharacteristic {
        GattCharacteristic { uuid, notifiable }
    }

    fn service(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> GattService {
        GattService { uuid, characteristics }
    }

    const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    #[test]
    fn test_exact_match_preferred() {
        let services = vec![
            service(BATTERY_SERVICE, vec![characteristic(BATTERY_LEVEL, true)]),
            service(
                UUID_SENSOR_SERVICE,
                vec![
                    characteristic(BATTERY_LEVEL, true),
                    characteristic(UUID_SENSOR_CHARACTERISTIC, true),
                ],
            ),
        ];
        let selected = select_target(&services, &TargetUuids::default()).expect("target");
        assert_eq!(selected.service, UUID_SENSOR_SERVICE);
        assert_eq!(selected.characteristic, UUID_SENSOR_CHARACTERISTIC);
        assert_eq!(selected.tier, MatchTier::Exact);
    }

    #[test]
    fn test_partial_match_on_leading_group() {
        // Vendor kept the leading group but changed the tail
        let mislabelled_service = Uuid::from_u128(0x12345678_0000_1000_8000_00805f9b34fb);
        let mislabelled_char = Uuid::from_u128(0x87654321_0000_1000_8000_00805f9b34fb);
        let services = vec![
            service(BATTERY_SERVICE, vec![characteristic(BATTERY_LEVEL, true)]),
            service(
                mislabelled_service,
                vec![characteristic(BATTERY_LEVEL, false), characteristic(mislabelled_char, true)],
            ),
        ];
        let selected = select_target(&services, &TargetUuids::default()).expect("target");
        assert_eq!(selected.service, mislabelled_service);
        assert_eq!(selected.characteristic, mislabelled_char);
        assert_eq!(selected.tier, MatchTier::Partial);
    }

    #[test]
    fn test_first_available_fallback() {
        let unlisted_service = Uuid::from_u128(0xdeadbeef_0000_1000_8000_00805f9b34fb);
        let unlisted_char = Uuid::from_u128(0xfeedface_0000_1000_8000_00805f9b34fb);
        let services = vec![service(unlisted_service, vec![characteristic(unlisted_char, true)])];
        let selected = select_target(&services, &TargetUuids::default()).expect("target");
        assert_eq!(selected.service, unlisted_service);
        assert_eq!(selected.characteristic, unlisted_char);
        assert_eq!(selected.tier, MatchTier::FirstAvailable);
    }

    #[test]
    fn test_first_available_prefers_notifiable() {
        let services = vec![service(
            BATTERY_SERVICE,
            vec![characteristic(BATTERY_LEVEL, false), characteristic(Uuid::from_u128(0xabcdef01), true)],
        )];
        let selected = select_target(&services, &TargetUuids::default()).expect("target");
        assert_eq!(selected.characteristic, Uuid::from_u128(0xabcdef01));
        assert!(selected.notifiable);
    }

    #[test]
    fn test_empty_services_are_skipped() {
        let services = vec![
            service(UUID_SENSOR_SERVICE, vec![]),
            service(BATTERY_SERVICE, vec![characteristic(BATTERY_LEVEL, false)]),
        ];
        let selected = select_target(&services, &TargetUuids::default()).expect("target");
        assert_eq!(selected.service, BATTERY_SERVICE);
        assert!(!selected.notifiable);
    }

    #[test]
    fn test_characteristic_borrowed_from_service_list() {
        let characteristics = vec![
            characteristic(BATTERY_LEVEL, true),
            characteristic(UUID_SENSOR_CHARACTERISTIC, true),
        ];
        let (chosen, tier) = {
            let target = UUID_SENSOR_CHARACTERISTIC;
            select_characteristic(&characteristics, &target).expect("characteristic")
        };
        assert!(std::ptr::eq(chosen, &characteristics[1]));
        assert_eq!(tier, MatchTier::Exact);
        assert_eq!(select_characteristic(&[], &BATTERY_LEVEL), None);
    }

    #[test]
    fn test_nothing_selectable() {
        assert_eq!(select_target(&[], &TargetUuids::default()), None);
        let services = vec![service(UUID_SENSOR_SERVICE, vec![])];
        assert_eq!(select_target(&services, &TargetUuids::default()), None);
    }
}
