use std::cmp::Ordering;

/// A wireless peripheral discovered during a scan
///
/// Identity is the transport-assigned `id`; name and signal strength are
/// whatever the advertisement carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralDescriptor {
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Advertised name, if it is non-empty
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.trim().is_empty())
    }
}

/// Deduplicated set of peripherals found during the current scan pass
#[derive(Debug, Default, Clone)]
pub struct PeripheralRegistry {
    devices: Vec<PeripheralDescriptor>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peripheral; returns false if its id is already present
    pub fn add(&mut self, descriptor: PeripheralDescriptor) -> bool {
        if self.contains(&descriptor.id) {
            return false;
        }
        self.devices.push(descriptor);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.iter().any(|d| d.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralDescriptor> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Peripherals in display order
    ///
    /// The `priority_id` peripheral comes first, then named peripherals before
    /// anonymous ones, then alphabetical by name. Ties keep discovery order.
    pub fn list_ordered(&self, priority_id: Option<&str>) -> Vec<PeripheralDescriptor> {
        let mut ordered = self.devices.clone();
        ordered.sort_by(|a, b| {
            let a_priority = priority_id == Some(a.id.as_str());
            let b_priority = priority_id == Some(b.id.as_str());
            b_priority
                .cmp(&a_priority)
                .then_with(|| match (a.display_name(), b.display_name()) {
                    (Some(a_name), Some(b_name)) => a_name
                        .to_lowercase()
                        .cmp(&b_name.to_lowercase())
                        .then_with(|| a_name.cmp(b_name)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                })
        });
        ordered
    }
}
