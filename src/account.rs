use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::GenerationMode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    #[serde(default)]
    pub coins: u32,
    #[serde(default)]
    pub trial_credits: u32,
}

impl Balance {
    /// A trial credit always suffices, whatever the numeric cost.
    pub fn can_afford(&self, cost: u32) -> bool {
        self.trial_credits > 0 || self.coins >= cost
    }
}

/// Coins charged for one submission.
pub fn generation_cost(mode: GenerationMode, generate_variations: bool) -> u32 {
    if mode.has_flat_cost() || !generate_variations {
        1
    } else {
        2
    }
}

/// Read-mostly account balance shared between the controller and the host UI.
#[derive(Debug, Clone, Default)]
pub struct BalanceCell {
    inner: Arc<RwLock<Balance>>,
}

impl BalanceCell {
    pub fn new(balance: Balance) -> Self {
        Self {
            inner: Arc::new(RwLock::new(balance)),
        }
    }

    pub fn get(&self) -> Balance {
        *self.inner.read()
    }

    pub fn set(&self, balance: Balance) {
        *self.inner.write() = balance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_cost_modes_ignore_variations() {
        for mode in [GenerationMode::Mockups, GenerationMode::UiElements] {
            assert_eq!(generation_cost(mode, true), 1);
            assert_eq!(generation_cost(mode, false), 1);
        }
    }

    #[test]
    fn variations_double_the_cost_elsewhere() {
        for mode in [
            GenerationMode::Icons,
            GenerationMode::Illustrations,
            GenerationMode::Labels,
        ] {
            assert_eq!(generation_cost(mode, true), 2);
            assert_eq!(generation_cost(mode, false), 1);
        }
    }

    #[test]
    fn trial_credit_covers_any_cost() {
        let balance = Balance {
            coins: 0,
            trial_credits: 1,
        };
        assert!(balance.can_afford(2));
        assert!(!Balance::default().can_afford(1));
        assert!(Balance { coins: 1, trial_credits: 0 }.can_afford(1));
        assert!(!Balance { coins: 1, trial_credits: 0 }.can_afford(2));
    }

    #[test]
    fn cell_is_shared_between_clones() {
        let cell = BalanceCell::default();
        let other = cell.clone();
        other.set(Balance { coins: 7, trial_credits: 0 });
        assert_eq!(cell.get().coins, 7);
    }
}
