//! Model string to device kind resolution
//!
//! Devices report a model string like `zhimi.airpurifier.m1` through
//! `miIO.info`. The registry maps model prefixes to a device kind at
//! connect time, falling back to [`DeviceKind::Generic`].

/// Coarse device families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Generic,
    Vacuum,
    AirPurifier,
    Humidifier,
    Light,
    Switch,
    PowerStrip,
    Gateway,
    Sensor,
}

/// Prefix registry resolving model strings to kinds
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    prefixes: Vec<(String, DeviceKind)>,
}

impl ModelRegistry {
    /// An empty registry; everything resolves to `Generic`
    pub fn new() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// Registry seeded with the common model families
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (prefix, kind) in [
            ("rockrobo.vacuum", DeviceKind::Vacuum),
            ("roborock.vacuum", DeviceKind::Vacuum),
            ("zhimi.airpurifier", DeviceKind::AirPurifier),
            ("zhimi.humidifier", DeviceKind::Humidifier),
            ("yeelink.light", DeviceKind::Light),
            ("philips.light", DeviceKind::Light),
            ("chuangmi.plug", DeviceKind::Switch),
            ("qmi.powerstrip", DeviceKind::PowerStrip),
            ("zimi.powerstrip", DeviceKind::PowerStrip),
            ("lumi.gateway", DeviceKind::Gateway),
            ("lumi.sensor", DeviceKind::Sensor),
        ] {
            registry.register(prefix, kind);
        }
        registry
    }

    /// Register a model prefix
    pub fn register(&mut self, prefix: &str, kind: DeviceKind) {
        self.prefixes.push((prefix.to_string(), kind));
    }

    /// Resolve a model string; the longest matching prefix wins
    pub fn resolve(&self, model: &str) -> DeviceKind {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, kind)| *kind)
            .unwrap_or(DeviceKind::Generic)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_prefixes() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(
            registry.resolve("rockrobo.vacuum.v1"),
            DeviceKind::Vacuum
        );
        assert_eq!(
            registry.resolve("zhimi.airpurifier.m1"),
            DeviceKind::AirPurifier
        );
    }

    #[test]
    fn unknown_models_fall_back_to_generic() {
        let registry = ModelRegistry::with_defaults();
        assert_eq!(registry.resolve("acme.widget.v9"), DeviceKind::Generic);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut registry = ModelRegistry::new();
        registry.register("lumi", DeviceKind::Gateway);
        registry.register("lumi.sensor", DeviceKind::Sensor);
        assert_eq!(registry.resolve("lumi.sensor_magnet"), DeviceKind::Sensor);
        assert_eq!(registry.resolve("lumi.gateway.v3"), DeviceKind::Gateway);
    }
}
