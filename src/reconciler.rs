use crate::list::RelayList;
use crate::record::{RelayRecord, RelayTemplate};

/// Diffs the desired set of relays against the running set and partitions
/// them into what should keep running (or be freshly started) and what
/// should be cleaned up.
pub struct RelayReconciler;

impl RelayReconciler {
    /// For each template in `updated`, look for a running record in
    /// `current` with the same `local_mount`. If one exists and is
    /// materially equivalent, promote it (absorbing an `on_demand`-only
    /// change); otherwise introduce a fresh record from the template.
    /// Whatever remains in `current` afterwards is the cleanup list.
    ///
    /// The output list is built LIFO (reverse of `updated`'s order); order
    /// carries no semantic weight.
    pub fn reconcile(current: &mut RelayList, updated: Vec<RelayTemplate>) -> (RelayList, RelayList) {
        let mut keep_or_new = RelayList::new();

        for template in updated {
            let reused = current
                .find(&template.local_mount)
                .is_some_and(|existing| existing.materially_equivalent(&template));

            if reused {
                let mut existing = current.remove(&template.local_mount).expect("just matched");
                existing.hot_update(&template);
                keep_or_new.push(existing);
            } else {
                keep_or_new.push(RelayRecord::from_template(&template));
            }
        }

        let cleanup = std::mem::replace(current, RelayList::new());
        (keep_or_new, cleanup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(local_mount: &str, port: u16) -> RelayTemplate {
        RelayTemplate {
            server: "a".into(),
            port,
            mount: local_mount.into(),
            local_mount: local_mount.into(),
            username: None,
            password: None,
            mp3_metadata: false,
            on_demand: false,
            enable: true,
            fallback_mount: None,
            fallback_override: false,
        }
    }

    #[test]
    fn test_new_relay_is_introduced() {
        let mut current = RelayList::new();
        let (keep, cleanup) = RelayReconciler::reconcile(&mut current, vec![template("/a", 8000)]);
        assert_eq!(keep.len(), 1);
        assert_eq!(cleanup.len(), 0);
        assert_eq!(keep.find("/a").unwrap().server, "a");
    }

    #[test]
    fn test_idempotent_reconcile() {
        let mut current = RelayList::new();
        let (mut keep, cleanup) = RelayReconciler::reconcile(&mut current, vec![template("/a", 8000)]);
        assert_eq!(cleanup.len(), 0);

        let (keep2, cleanup2) = RelayReconciler::reconcile(&mut keep, vec![template("/a", 8000)]);
        assert_eq!(cleanup2.len(), 0, "re-applying an unchanged desired set must not produce cleanup");
        assert_eq!(keep2.len(), 1);
    }

    #[test]
    fn test_on_demand_hot_update_does_not_restart() {
        let mut current = RelayList::new();
        let (mut keep, _) = RelayReconciler::reconcile(&mut current, vec![template("/a", 8000)]);

        let mut changed = template("/a", 8000);
        changed.on_demand = true;
        let (keep2, cleanup) = RelayReconciler::reconcile(&mut keep, vec![changed]);

        assert_eq!(cleanup.len(), 0, "on_demand-only change must be a hot update, not a restart");
        assert!(keep2.find("/a").unwrap().on_demand);
    }

    #[test]
    fn test_material_change_triggers_restart() {
        let mut current = RelayList::new();
        let (mut keep, _) = RelayReconciler::reconcile(&mut current, vec![template("/a", 8000)]);

        let mut changed = template("/a", 8000);
        changed.server = "b".into();
        let (keep2, cleanup) = RelayReconciler::reconcile(&mut keep, vec![changed]);

        assert_eq!(cleanup.len(), 1, "a material field change must produce exactly one cleanup entry");
        assert_eq!(keep2.len(), 1);
        assert_eq!(keep2.find("/a").unwrap().server, "b");
    }

    #[test]
    fn test_removed_relay_goes_to_cleanup() {
        let mut current = RelayList::new();
        let (mut keep, _) = RelayReconciler::reconcile(&mut current, vec![template("/alpha", 8000), template("/beta", 8000)]);

        let (keep2, cleanup) = RelayReconciler::reconcile(&mut keep, vec![template("/beta", 8000), template("/gamma", 8000)]);

        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup.iter().next().unwrap().local_mount, "/alpha");
        assert_eq!(keep2.len(), 2);
        assert!(keep2.find("/beta").is_some());
        assert!(keep2.find("/gamma").is_some());
    }
}
