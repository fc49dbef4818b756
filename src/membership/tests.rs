//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Identity**: ids are stable across rejoin and never reused.
//! - **Liveness**: down/evicted nodes and what they leave behind.
//! - **Backup placement**: when backups get assigned and to whom.

#[cfg(test)]
mod tests {
    use crate::membership::registry::{NodeRegistry, Registration};
    use crate::membership::types::{ControlCommand, NodeId, NodeState};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    // ============================================================
    // IDENTITY TESTS
    // ============================================================

    #[test]
    fn test_register_assigns_monotonic_ids() {
        let mut registry = NodeRegistry::new(3);

        let a = registry.register(addr(9001), None);
        let b = registry.register(addr(9002), None);

        assert_eq!(a, Registration::New(NodeId(1)));
        assert_eq!(b, Registration::New(NodeId(2)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_same_address_is_idempotent() {
        let mut registry = NodeRegistry::new(3);

        let first = registry.register(addr(9001), None).id();
        registry.add_owned_path(first, "/docs/a.txt");
        registry.mark_down(first);

        let again = registry.register(addr(9001), None);

        assert_eq!(again, Registration::Rejoined(first));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_alive(first));
        assert_eq!(
            registry.get(first).unwrap().owned_paths,
            vec!["/docs/a.txt".to_string()]
        );
    }

    #[test]
    fn test_evicted_id_is_not_reused() {
        let mut registry = NodeRegistry::new(3);

        let a = registry.register(addr(9001), None).id();
        registry.evict(a);
        let b = registry.register(addr(9001), None).id();

        assert_ne!(a, b, "A re-registered address after eviction is a new node");
        assert_eq!(registry.liveness(a), None);
    }

    #[test]
    fn test_owned_paths_are_deduplicated() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();

        registry.add_owned_path(a, "/x");
        registry.add_owned_path(a, "/x");
        registry.add_owned_path(a, "/y");

        assert_eq!(registry.get(a).unwrap().owned_paths.len(), 2);
    }

    // ============================================================
    // LIVENESS TESTS
    // ============================================================

    #[test]
    fn test_mark_down_keeps_node_and_returns_paths() {
        let mut registry = NodeRegistry::new(3);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = registry.register(addr(9001), Some(tx)).id();
        registry.add_owned_path(a, "/a");

        let paths = registry.mark_down(a).expect("node exists");

        assert_eq!(paths, vec!["/a".to_string()]);
        assert_eq!(registry.liveness(a), Some(false));
        assert_eq!(registry.get(a).unwrap().state, NodeState::Down);
        assert!(
            !registry.get(a).unwrap().send(ControlCommand::Stop),
            "A down node has no control channel"
        );
    }

    #[test]
    fn test_control_channel_delivers_commands() {
        let mut registry = NodeRegistry::new(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = registry.register(addr(9001), Some(tx)).id();

        assert!(registry.get(a).unwrap().send(ControlCommand::CreateDir("/d".into())));
        assert_eq!(rx.try_recv().unwrap().to_string(), "CREATE_DIR /d");
    }

    #[test]
    fn test_evict_clears_backup_slots_of_other_nodes() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let b = registry.register(addr(9002), None).id();
        let c = registry.register(addr(9003), None).id();
        registry.assign_backups(c);

        registry.evict(b);

        let backups = registry.get(a).unwrap().backups;
        assert!(!backups.contains(&Some(b)));
        assert!(backups.contains(&Some(c)));
    }

    // ============================================================
    // BACKUP PLACEMENT TESTS
    // ============================================================

    #[test]
    fn test_no_backups_below_replication_factor() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let b = registry.register(addr(9002), None).id();

        assert!(registry.assign_backups(b).is_empty());
        assert!(!registry.get(a).unwrap().has_backups());
    }

    #[test]
    fn test_third_node_triggers_founder_backups() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let b = registry.register(addr(9002), None).id();
        let c = registry.register(addr(9003), None).id();

        let assigned = registry.assign_backups(c);

        assert_eq!(assigned.len(), 3, "both founders and the joiner get backups");
        assert_eq!(registry.get(a).unwrap().backups, [Some(b), Some(c)]);
        assert_eq!(registry.get(b).unwrap().backups, [Some(a), Some(c)]);

        let joiner = registry.get(c).unwrap().backups;
        assert!(!joiner.contains(&Some(c)));
        assert_ne!(joiner[0], joiner[1]);
    }

    #[test]
    fn test_down_nodes_do_not_count_towards_placement() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let b = registry.register(addr(9002), None).id();
        registry.mark_down(b);
        let c = registry.register(addr(9003), None).id();

        assert!(registry.assign_backups(c).is_empty(), "only two nodes are alive");
        assert_eq!(registry.get(a).unwrap().backups, [None, None]);
        assert_eq!(registry.get(c).unwrap().backups, [None, None]);

        let d = registry.register(addr(9004), None).id();
        let assigned = registry.assign_backups(d);

        assert!(assigned.contains(&a));
        assert_eq!(registry.get(a).unwrap().backups, [Some(c), Some(d)]);
        assert!(!registry.get(b).unwrap().has_backups(), "down founder is skipped");

        let joiner = registry.get(d).unwrap().backups;
        assert!(joiner.iter().all(|slot| slot.is_some()));
        assert!(!joiner.contains(&Some(b)));
    }

    #[test]
    fn test_later_joiner_gets_distinct_live_backups() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let _b = registry.register(addr(9002), None).id();
        let c = registry.register(addr(9003), None).id();
        registry.assign_backups(c);

        registry.mark_down(a);
        let d = registry.register(addr(9004), None).id();

        for _ in 0..20 {
            let assigned = registry.assign_backups(d);
            if !assigned.is_empty() {
                assert_eq!(assigned, vec![d], "founders are never reconsidered");
            }
        }

        let backups = registry.get(d).unwrap().backups;
        assert!(backups.iter().all(|b| b.is_some()));
        assert!(!backups.contains(&Some(d)));
        assert!(!backups.contains(&Some(a)), "down nodes are never picked");
        assert_ne!(backups[0], backups[1]);
    }

    #[test]
    fn test_live_backups_skip_down_nodes() {
        let mut registry = NodeRegistry::new(3);
        let a = registry.register(addr(9001), None).id();
        let b = registry.register(addr(9002), None).id();
        let c = registry.register(addr(9003), None).id();
        registry.assign_backups(c);

        registry.mark_down(b);

        assert_eq!(registry.live_backups(a), vec![(1, c)]);
    }

    #[test]
    fn test_control_command_lines() {
        let commands = [
            ControlCommand::CreateDir("/d".into()),
            ControlCommand::CreateFile("/d/f.txt".into()),
            ControlCommand::Delete("/d".into()),
            ControlCommand::Stop,
        ];
        for command in commands {
            assert_eq!(ControlCommand::parse(&command.to_string()), Some(command));
        }
        assert_eq!(ControlCommand::parse("DELETE"), None);
        assert_eq!(ControlCommand::parse("STOP now"), None);
    }
}
