//! Who currently owns which mount point.
//!
//! The registry is an explicit object rather than page-global state: `WidgetRuntime` owns one and
//! the browser adapter exposes it through the global facade so a re-injected script can evict
//! whatever the previous copy left behind.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::frame::is_widget_frame_url;
use crate::host::PageDom;

const PAGE_SLOT: &str = "*";

/// Whether exclusivity is per mount element or page-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistryMode {
    #[default]
    PerMount,
    SinglePage,
}

struct Claim<T> {
    instance_id: String,
    instance: T,
}

pub struct InstanceRegistry<T> {
    mode: RegistryMode,
    claims: RefCell<BTreeMap<String, Claim<T>>>,
}

impl<T> InstanceRegistry<T> {
    #[must_use]
    pub fn new(mode: RegistryMode) -> Self {
        Self {
            mode,
            claims: RefCell::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    /// Removes and returns whatever holds the slot `container_id` maps to. The caller destroys
    /// the returned instances before constructing the new one.
    pub fn take_conflicts(&self, container_id: &str) -> Vec<T> {
        let key = self.slot_key(container_id);
        self.claims
            .borrow_mut()
            .remove(&key)
            .map(|claim| claim.instance)
            .into_iter()
            .collect()
    }

    /// Records `instance` as the holder of its slot, returning a previous holder if one was
    /// still present.
    pub fn claim(&self, container_id: &str, instance_id: &str, instance: T) -> Option<T> {
        let key = self.slot_key(container_id);
        tracing::debug!(slot = %key, instance_id, "Claiming widget slot");
        self.claims
            .borrow_mut()
            .insert(
                key,
                Claim {
                    instance_id: instance_id.to_string(),
                    instance,
                },
            )
            .map(|claim| claim.instance)
    }

    /// Clears the slot only if `instance_id` still holds it, so a superseded instance cannot
    /// release its successor's claim.
    pub fn release(&self, container_id: &str, instance_id: &str) -> Option<T> {
        let key = self.slot_key(container_id);
        let mut claims = self.claims.borrow_mut();
        if claims
            .get(&key)
            .is_some_and(|claim| claim.instance_id == instance_id)
        {
            return claims.remove(&key).map(|claim| claim.instance);
        }
        None
    }

    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.claims.borrow_mut())
            .into_values()
            .map(|claim| claim.instance)
            .collect()
    }

    #[must_use]
    pub fn holder(&self, container_id: &str) -> Option<String> {
        self.claims
            .borrow()
            .get(&self.slot_key(container_id))
            .map(|claim| claim.instance_id.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.borrow().is_empty()
    }

    /// Removes widget frames that no live instance owns within the scope `container_id` belongs
    /// to. Must run after the slot's conflicts were destroyed, so every widget frame left in that
    /// scope is an orphan. Returns how many frames were removed.
    pub fn sweep_orphans<D: PageDom + ?Sized>(&self, dom: &D, container_id: &str) -> usize {
        let mut removed = 0;
        for frame in dom.discover_frames() {
            if !is_widget_frame_url(&frame.src) {
                continue;
            }
            let in_scope = match self.mode {
                RegistryMode::SinglePage => true,
                RegistryMode::PerMount => frame.container_id.as_deref() == Some(container_id),
            };
            if in_scope {
                tracing::info!(src = %frame.src, "Removing orphaned widget frame");
                dom.remove_frame(frame.handle);
                removed += 1;
            }
        }
        removed
    }

    fn slot_key(&self, container_id: &str) -> String {
        match self.mode {
            RegistryMode::PerMount => container_id.to_string(),
            RegistryMode::SinglePage => PAGE_SLOT.to_string(),
        }
    }
}

impl<T> std::fmt::Debug for InstanceRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let claims = self.claims.borrow();
        f.debug_struct("InstanceRegistry")
            .field("mode", &self.mode)
            .field(
                "claims",
                &claims
                    .iter()
                    .map(|(slot, claim)| (slot.as_str(), claim.instance_id.as_str()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_host::FakeHost;

    #[test]
    fn per_mount_slots_are_independent() {
        let registry = InstanceRegistry::new(RegistryMode::PerMount);
        assert!(registry.claim("left", "a", "A").is_none());
        assert!(registry.claim("right", "b", "B").is_none());

        assert_eq!(registry.take_conflicts("left"), vec!["A"]);
        assert_eq!(registry.holder("left"), None);
        assert_eq!(registry.holder("right").as_deref(), Some("b"));
    }

    #[test]
    fn single_page_mode_has_one_slot() {
        let registry = InstanceRegistry::new(RegistryMode::SinglePage);
        registry.claim("left", "a", "A");
        assert_eq!(registry.take_conflicts("right"), vec!["A"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_release_keeps_successor_claim() {
        let registry = InstanceRegistry::new(RegistryMode::PerMount);
        registry.claim("chat", "first", 1);
        registry.take_conflicts("chat");
        registry.claim("chat", "second", 2);

        assert_eq!(registry.release("chat", "first"), None);
        assert_eq!(registry.holder("chat").as_deref(), Some("second"));
        assert_eq!(registry.release("chat", "second"), Some(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_empties_every_slot() {
        let registry = InstanceRegistry::new(RegistryMode::PerMount);
        registry.claim("a", "1", 1);
        registry.claim("b", "2", 2);
        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn sweep_removes_only_widget_frames_in_scope() {
        let host = FakeHost::new();
        host.add_mount("chat");
        host.add_mount("other");
        host.inject_orphan_frame("chat", "https://chat.example.com/widget?theme=auto&v=1");
        host.inject_orphan_frame("chat", "https://video.example.org/embed/123");
        host.inject_orphan_frame("other", "https://chat.example.com/widget?v=1");

        let registry = InstanceRegistry::<()>::new(RegistryMode::PerMount);
        assert_eq!(registry.sweep_orphans(&*host, "chat"), 1);
        let remaining = host
            .frames()
            .into_iter()
            .map(|frame| frame.spec.url)
            .collect::<Vec<_>>();
        assert_eq!(
            remaining,
            vec![
                "https://video.example.org/embed/123".to_string(),
                "https://chat.example.com/widget?v=1".to_string(),
            ]
        );

        let page_wide = InstanceRegistry::<()>::new(RegistryMode::SinglePage);
        assert_eq!(page_wide.sweep_orphans(&*host, "chat"), 1);
        assert_eq!(host.frames().len(), 1);
    }
}
