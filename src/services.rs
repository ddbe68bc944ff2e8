//! Known generation services, their wire aliases, and the composite
//! `{serviceId}-gen{n}` keys that index streaming results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GenerationError;

pub const PRIMARY_GENERATION: u8 = 1;
pub const VARIATION_GENERATION: u8 = 2;

/// Composite ledger key: one backend service at one generation index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    service_id: String,
    generation_index: u8,
}

impl ServiceKey {
    pub fn new(service_id: impl Into<String>, generation_index: u8) -> Result<Self, GenerationError> {
        let service_id = service_id.into();
        if service_id.trim().is_empty() {
            return Err(GenerationError::Decode("empty service id".into()));
        }
        if !(PRIMARY_GENERATION..=VARIATION_GENERATION).contains(&generation_index) {
            return Err(GenerationError::Decode(format!(
                "generation index {generation_index} out of range for {service_id}"
            )));
        }
        Ok(Self {
            service_id,
            generation_index,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn generation_index(&self) -> u8 {
        self.generation_index
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-gen{}", self.service_id, self.generation_index)
    }
}

impl FromStr for ServiceKey {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, index) = s
            .rsplit_once("-gen")
            .ok_or_else(|| GenerationError::Decode(format!("malformed service key: {s}")))?;
        let index: u8 = index
            .parse()
            .map_err(|_| GenerationError::Decode(format!("malformed service key: {s}")))?;
        ServiceKey::new(service, index)
    }
}

impl Serialize for ServiceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical service ids and the wire aliases each one accepts.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, BTreeSet<String>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("flux", &["falai", "flux-pro"]);
        registry.register("recraft", &["recraft-v3"]);
        registry.register("photon", &["luma"]);
        registry.register("gpt", &["openai", "gpt-image"]);
        registry.register("banana", &["gemini", "nano-banana"]);
        registry
    }
}

impl ServiceRegistry {
    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, canonical: &str, aliases: &[&str]) -> &mut Self {
        let entry = self.services.entry(canonical.to_ascii_lowercase()).or_default();
        entry.extend(aliases.iter().map(|a| a.to_ascii_lowercase()));
        self
    }

    /// Rejects aliases claimed by two services or shadowing another canonical id.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (canonical, aliases) in &self.services {
            for alias in aliases {
                if alias == canonical {
                    continue;
                }
                if self.services.contains_key(alias) {
                    return Err(GenerationError::Validation(format!(
                        "alias '{alias}' of '{canonical}' shadows a canonical service id"
                    )));
                }
                if let Some(owner) = seen.insert(alias.as_str(), canonical.as_str()) {
                    return Err(GenerationError::Validation(format!(
                        "alias '{alias}' claimed by both '{owner}' and '{canonical}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn canonical_ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn is_known(&self, service_id: &str) -> bool {
        self.services.contains_key(&service_id.to_ascii_lowercase())
    }

    /// Maps a wire source name onto its canonical id. Unknown names pass
    /// through lowercased so ad-hoc services still match their own keys.
    pub fn canonicalize(&self, source: &str) -> String {
        let needle = source.trim().to_ascii_lowercase();
        if self.services.contains_key(&needle) {
            return needle;
        }
        self.services
            .iter()
            .find(|(_, aliases)| aliases.contains(&needle))
            .map(|(canonical, _)| canonical.clone())
            .unwrap_or(needle)
    }

    /// Whether `source` names the service behind `key`, directly or via alias.
    pub fn matches(&self, key: &ServiceKey, source: &str) -> bool {
        self.canonicalize(source) == self.canonicalize(key.service_id())
    }
}
