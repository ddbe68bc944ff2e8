//! Staggered reveal of freshly arrived thumbnails, one timer per service key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::services::ServiceKey;

/// Read handle on the visible counts, cheap to clone into a UI.
#[derive(Debug, Clone, Default)]
pub struct RevealView {
    visible: Arc<RwLock<HashMap<ServiceKey, usize>>>,
}

impl RevealView {
    pub fn visible_count(&self, key: &ServiceKey) -> usize {
        self.visible.read().get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<ServiceKey, usize> {
        self.visible.read().clone()
    }
}

#[derive(Debug)]
pub struct RevealSequencer {
    interval: Duration,
    view: RevealView,
    tasks: HashMap<ServiceKey, JoinHandle<()>>,
}

impl RevealSequencer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            view: RevealView::default(),
            tasks: HashMap::new(),
        }
    }

    pub fn view(&self) -> RevealView {
        self.view.clone()
    }

    pub fn visible_count(&self, key: &ServiceKey) -> usize {
        self.view.visible_count(key)
    }

    /// Reveals `total` icons for `key` from zero. Other keys are unaffected.
    pub fn start(&mut self, key: ServiceKey, total: usize) {
        self.start_from(key, 0, total);
    }

    /// Continues revealing from `from` up to `total`, e.g. after "generate more".
    pub fn start_from(&mut self, key: ServiceKey, from: usize, total: usize) {
        self.cancel(&key);
        let from = from.min(total);
        self.view.visible.write().insert(key.clone(), from);
        if from == total {
            return;
        }

        let visible = Arc::clone(&self.view.visible);
        let interval = self.interval;
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            for shown in from + 1..=total {
                tokio::time::sleep(interval).await;
                visible.write().insert(task_key.clone(), shown);
            }
        });
        self.tasks.insert(key, handle);
    }

    pub fn cancel(&mut self, key: &ServiceKey) {
        if let Some(handle) = self.tasks.remove(key) {
            handle.abort();
        }
    }

    pub fn is_animating(&self, key: &ServiceKey) -> bool {
        self.tasks.get(key).is_some_and(|h| !h.is_finished())
    }

    /// Aborts every pending timer and forgets all counts.
    pub fn clear(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
        self.view.visible.write().clear();
    }
}

impl Drop for RevealSequencer {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ServiceKey {
        raw.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reveals_one_icon_per_interval() {
        let mut sequencer = RevealSequencer::new(Duration::from_millis(150));
        let flux = key("flux-gen1");
        sequencer.start(flux.clone(), 4);
        assert_eq!(sequencer.visible_count(&flux), 0);

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(sequencer.visible_count(&flux), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sequencer.visible_count(&flux), 3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sequencer.visible_count(&flux), 4);
        assert!(!sequencer.is_animating(&flux));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_one_key_leaves_others_running() {
        let mut sequencer = RevealSequencer::new(Duration::from_millis(150));
        let flux = key("flux-gen1");
        let recraft = key("recraft-gen1");
        sequencer.start(flux.clone(), 6);
        sequencer.start(recraft.clone(), 6);

        tokio::time::sleep(Duration::from_millis(310)).await;
        sequencer.start(flux.clone(), 6);
        assert_eq!(sequencer.visible_count(&flux), 0);
        assert_eq!(sequencer.visible_count(&recraft), 2);

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(sequencer.visible_count(&flux), 1);
        assert_eq!(sequencer.visible_count(&recraft), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_stops_pending_updates() {
        let mut sequencer = RevealSequencer::new(Duration::from_millis(150));
        let flux = key("flux-gen1");
        let view = sequencer.view();
        sequencer.start(flux.clone(), 10);
        tokio::time::sleep(Duration::from_millis(160)).await;
        sequencer.clear();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(view.visible_count(&flux), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn continuing_reveal_starts_from_existing_count() {
        let mut sequencer = RevealSequencer::new(Duration::from_millis(150));
        let flux = key("flux-gen1");
        sequencer.start_from(flux.clone(), 9, 12);
        assert_eq!(sequencer.visible_count(&flux), 9);
        tokio::time::sleep(Duration::from_millis(460)).await;
        assert_eq!(sequencer.visible_count(&flux), 12);

        sequencer.start(key("gpt-gen1"), 0);
        assert!(!sequencer.is_animating(&key("gpt-gen1")));
    }
}
