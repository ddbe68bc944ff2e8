//! Result Aggregator: the in-memory ledger of one generation session and the
//! views derived from it.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::events::ServiceUpdate;
use crate::models::{GenerationResponse, Icon, ServiceResult, ServiceStatus};
use crate::services::{ServiceKey, ServiceRegistry, PRIMARY_GENERATION, VARIATION_GENERATION};

/// How many icons trial mode let through for a key, out of how many streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialCut {
    pub shown: usize,
    pub requested: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct LedgerEntry {
    result: ServiceResult,
    trial: Option<TrialCut>,
}

impl LedgerEntry {
    fn new(result: ServiceResult) -> Self {
        Self { result, trial: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// A `started` update arrived after the key already finished.
    IgnoredRegression,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultLedger {
    entries: BTreeMap<ServiceKey, LedgerEntry>,
    unassigned: Vec<Icon>,
    trial_mode: bool,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// One placeholder per enabled service and generation index.
    pub fn seeded(enabled_services: &BTreeMap<String, bool>, with_variations: bool) -> Self {
        let mut ledger = Self::new();
        let indices: &[u8] = if with_variations {
            &[PRIMARY_GENERATION, VARIATION_GENERATION]
        } else {
            &[PRIMARY_GENERATION]
        };
        for (service, _) in enabled_services.iter().filter(|(_, enabled)| **enabled) {
            for &index in indices {
                match ServiceKey::new(service.clone(), index) {
                    Ok(key) => {
                        ledger
                            .entries
                            .insert(key, LedgerEntry::new(ServiceResult::placeholder(index)));
                    }
                    Err(e) => warn!(service = %service, error = %e, "skipping unusable service id"),
                }
            }
        }
        ledger
    }

    /// Rebuilds a finished ledger from a polled completion payload.
    pub fn from_completed(response: &GenerationResponse, registry: &ServiceRegistry) -> Self {
        let mut ledger = Self::new();
        for (service, results) in &response.service_results {
            for (position, result) in results.iter().enumerate() {
                if result.status == ServiceStatus::Disabled {
                    continue;
                }
                let index = match result.generation_index {
                    0 => u8::try_from(position + 1).unwrap_or(u8::MAX),
                    index => index,
                };
                match ServiceKey::new(registry.canonicalize(service), index) {
                    Ok(key) => {
                        let mut result = result.clone();
                        result.generation_index = index;
                        ledger.entries.insert(key, LedgerEntry::new(result));
                    }
                    Err(e) => warn!(service = %service, error = %e, "skipping polled result"),
                }
            }
        }

        let ledger_has_icons = ledger.entries.values().any(|e| !e.result.icons.is_empty());
        if !response.icons.is_empty() && !ledger_has_icons {
            ledger.reconcile_completion(response, registry);
        }
        ledger.trial_mode = response.trial_mode;
        ledger
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.entries.keys()
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&ServiceResult> {
        self.entries.get(key).map(|e| &e.result)
    }

    pub fn trial_cut(&self, key: &ServiceKey) -> Option<TrialCut> {
        self.entries.get(key).and_then(|e| e.trial)
    }

    pub fn trial_mode(&self) -> bool {
        self.trial_mode
    }

    pub fn icon_count(&self, key: &ServiceKey) -> usize {
        self.get(key).map_or(0, |r| r.icons.len())
    }

    /// Keys with at least one icon, with their counts.
    pub fn icon_counts(&self) -> Vec<(ServiceKey, usize)> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.result.icons.is_empty())
            .map(|(k, e)| (k.clone(), e.result.icons.len()))
            .collect()
    }

    /// Last write wins per field; a finished key never goes back to `started`.
    pub fn apply_update(&mut self, update: ServiceUpdate) -> UpdateOutcome {
        let ServiceUpdate {
            key,
            status,
            message,
            generation_time_ms,
            icons,
            original_grid_image_base64,
            seed,
        } = update;

        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            debug!(service_key = %key, "update for unseeded key");
            LedgerEntry::new(ServiceResult::placeholder(key.generation_index()))
        });
        let result = &mut entry.result;
        if result.status.is_terminal() && !status.is_terminal() {
            debug!(service_key = %key, ?status, "ignoring status regression");
            return UpdateOutcome::IgnoredRegression;
        }

        result.status = status;
        if let Some(message) = message {
            result.message = message;
        }
        if let Some(ms) = generation_time_ms {
            result.generation_time_ms = ms;
        }
        if let Some(seed) = seed {
            result.seed = Some(seed);
        }
        if status == ServiceStatus::Success {
            if let Some(icons) = icons {
                result.icons = icons;
            }
            if let Some(grid) = original_grid_image_base64 {
                result.original_grid_image_base64 = Some(grid);
            }
        }
        UpdateOutcome::Applied
    }

    /// Makes the completion payload the source of truth for what each key shows.
    /// With an empty icon list the streamed icons stand.
    pub fn reconcile_completion(&mut self, response: &GenerationResponse, registry: &ServiceRegistry) {
        self.trial_mode = response.trial_mode;
        if response.icons.is_empty() {
            return;
        }
        if self.entries.is_empty() {
            self.seed_from_sources(&response.icons, registry);
        }

        let streamed: BTreeMap<ServiceKey, usize> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.result.icons.len()))
            .collect();
        let mut buckets: BTreeMap<ServiceKey, Vec<Icon>> =
            self.entries.keys().map(|k| (k.clone(), Vec::new())).collect();
        let mut unassigned = Vec::new();

        let mut unpinned: BTreeMap<Vec<ServiceKey>, Vec<Icon>> = BTreeMap::new();
        for icon in &response.icons {
            let candidates: Vec<ServiceKey> = match icon.service_source.as_deref() {
                Some(source) => self
                    .entries
                    .keys()
                    .filter(|k| registry.matches(k, source))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            if candidates.is_empty() {
                unassigned.push(icon.clone());
                continue;
            }
            let pinned = icon
                .generation_index
                .and_then(|index| candidates.iter().find(|k| k.generation_index() == index))
                .cloned();
            match pinned.and_then(|k| buckets.get_mut(&k)) {
                Some(bucket) => bucket.push(icon.clone()),
                None => unpinned.entry(candidates).or_default().push(icon.clone()),
            }
        }

        for (candidates, icons) in unpinned {
            let room: Vec<usize> = candidates
                .iter()
                .map(|k| {
                    let quota = streamed.get(k).copied().unwrap_or(0);
                    quota.saturating_sub(buckets.get(k).map_or(0, Vec::len))
                })
                .collect();
            let shares = split_shares(icons.len(), &room);
            let mut icons = icons.into_iter();
            for (key, share) in candidates.iter().zip(shares) {
                if let Some(bucket) = buckets.get_mut(key) {
                    bucket.extend(icons.by_ref().take(share));
                }
            }
        }

        for (key, icons) in buckets {
            let requested = streamed.get(&key).copied().unwrap_or(0);
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.trial = (self.trial_mode && icons.len() < requested).then_some(TrialCut {
                    shown: icons.len(),
                    requested,
                });
                entry.result.icons = icons;
            }
        }
        if !unassigned.is_empty() {
            warn!(count = unassigned.len(), "completion icons matched no service key");
        }
        self.unassigned = unassigned;
    }

    /// Nothing was streamed (e.g. resumed after a reload): one successful
    /// entry per source/index found on the icons themselves.
    fn seed_from_sources(&mut self, icons: &[Icon], registry: &ServiceRegistry) {
        for icon in icons {
            let Some(source) = icon.service_source.as_deref() else {
                continue;
            };
            let index = icon.generation_index.unwrap_or(PRIMARY_GENERATION);
            if let Ok(key) = ServiceKey::new(registry.canonicalize(source), index) {
                self.entries.entry(key).or_insert_with(|| {
                    let mut result = ServiceResult::placeholder(index);
                    result.status = ServiceStatus::Success;
                    result.message = String::new();
                    LedgerEntry::new(result)
                });
            }
        }
    }

    /// Adds icons from "generate more"; existing icons are left as they are.
    pub fn append_icons(&mut self, key: &ServiceKey, icons: Vec<Icon>) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.result.icons.extend(icons);
                true
            }
            None => false,
        }
    }

    /// Stored message plus a freshly rendered trial note.
    pub fn display_message(&self, key: &ServiceKey) -> Option<String> {
        self.entries.get(key).map(render_message)
    }

    /// Every icon, key by key, then any icons no key claimed.
    pub fn flat_icons(&self) -> Vec<Icon> {
        self.entries
            .values()
            .flat_map(|e| e.result.icons.iter().cloned())
            .chain(self.unassigned.iter().cloned())
            .collect()
    }

    /// Results grouped under each known canonical service, in generation order.
    pub fn grouped(&self, registry: &ServiceRegistry) -> BTreeMap<String, Vec<ServiceResult>> {
        let mut grouped: BTreeMap<String, Vec<ServiceResult>> = BTreeMap::new();
        for (key, entry) in &self.entries {
            let canonical = registry.canonicalize(key.service_id());
            if !registry.is_known(&canonical) {
                continue;
            }
            let mut result = entry.result.clone();
            result.message = render_message(entry);
            grouped.entry(canonical).or_default().push(result);
        }
        for results in grouped.values_mut() {
            results.sort_by_key(|r| r.generation_index);
        }
        grouped
    }

    pub fn response(&self, request_id: &str, registry: &ServiceRegistry) -> GenerationResponse {
        GenerationResponse {
            icons: self.flat_icons(),
            request_id: request_id.to_string(),
            service_results: self.grouped(registry),
            trial_mode: self.trial_mode,
        }
    }
}

fn render_message(entry: &LedgerEntry) -> String {
    match entry.trial {
        Some(cut) => {
            let note = format!("(Trial: {} of {} icons)", cut.shown, cut.requested);
            if entry.result.message.is_empty() {
                note
            } else {
                format!("{} {}", entry.result.message, note)
            }
        }
        None => entry.result.message.clone(),
    }
}

/// How many of `total` icons each key takes, given the room each has left
/// from what it streamed. A shortfall (trial truncation) is spread in
/// proportion to that room, earlier keys taking the remainder. Otherwise keys
/// fill in order and the last takes any excess. With no room anywhere the
/// first key takes all.
fn split_shares(total: usize, room: &[usize]) -> Vec<usize> {
    let mut shares = vec![0; room.len()];
    let capacity: usize = room.iter().sum();
    if shares.is_empty() {
        return shares;
    }
    if capacity == 0 {
        shares[0] = total;
        return shares;
    }
    if total < capacity {
        for (share, &r) in shares.iter_mut().zip(room) {
            *share = total * r / capacity;
        }
        let mut left = total - shares.iter().sum::<usize>();
        for (share, &r) in shares.iter_mut().zip(room) {
            if left == 0 {
                break;
            }
            if r > *share {
                *share += 1;
                left -= 1;
            }
        }
        return shares;
    }
    shares.copy_from_slice(room);
    if let Some(last) = shares.last_mut() {
        *last += total - capacity;
    }
    shares
}
