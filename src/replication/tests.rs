//! Replication Module Tests
//!
//! Runs the manager against an in-memory transport.
//!
//! ## Test Scopes
//! - **Snapshot**: backup assignment copies existing paths and records shadows.
//! - **Failover**: backup shadows answer when the primary is down.
//! - **Mirroring**: writes reach every live backup, failures are tolerated.
//! - **Copy**: the four file/directory combinations.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use crate::error::FsError;
    use crate::membership::types::NodeId;
    use crate::naming::namespace::{Namespace, Resolution};
    use crate::replication::manager::ReplicationManager;
    use crate::replication::peer::memory::MemoryTransport;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    const A_ADDR: u16 = 7001;
    const B_ADDR: u16 = 7002;
    const C_ADDR: u16 = 7003;

    struct Cluster {
        namespace: Namespace,
        transport: Arc<MemoryTransport>,
        manager: ReplicationManager,
        a: NodeId,
        b: NodeId,
        c: NodeId,
    }

    /// Three nodes: A holds `/a/f1.txt`, B holds the empty directory `/b`.
    async fn cluster() -> Cluster {
        let namespace = Namespace::new(5, 3);
        let transport = Arc::new(MemoryTransport::default());
        let manager = ReplicationManager::new(transport.clone());

        transport.put(addr(A_ADDR), "/a/f1.txt", b"hello");

        let (a, b, c, assigned) = {
            let mut state = namespace.lock().await;
            let a = state
                .register(
                    addr(A_ADDR),
                    None,
                    &[("/a".into(), true), ("/a/f1.txt".into(), false)],
                )
                .id();
            let b = state
                .register(addr(B_ADDR), None, &[("/b".into(), true)])
                .id();
            let c = state.register(addr(C_ADDR), None, &[]).id();
            let assigned = state.registry.assign_backups(c);
            (a, b, c, assigned)
        };

        manager.snapshot(&namespace, &assigned).await;

        Cluster {
            namespace,
            transport,
            manager,
            a,
            b,
            c,
        }
    }

    // ============================================================
    // SNAPSHOT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_snapshot_creates_two_shadow_entries() {
        let cluster = cluster().await;
        let state = cluster.namespace.lock().await;

        assert_eq!(
            state.registry.get(cluster.a).unwrap().backups,
            [Some(cluster.b), Some(cluster.c)]
        );
        assert_eq!(
            state.trie.resolve("#backup1/a/f1.txt", |_| true),
            Some(cluster.b)
        );
        assert_eq!(
            state.trie.resolve("#backup2/a/f1.txt", |_| true),
            Some(cluster.c)
        );
        assert_eq!(
            cluster.transport.file(addr(C_ADDR), "/a/f1.txt").as_deref(),
            Some(&b"hello"[..])
        );
        assert!(cluster.transport.has_dir(addr(B_ADDR), "/a"));
    }

    #[tokio::test]
    async fn test_snapshot_does_not_change_primary_resolution() {
        let cluster = cluster().await;
        let mut state = cluster.namespace.lock().await;

        assert_eq!(state.resolve("/a/f1.txt"), Some(Resolution::Primary(cluster.a)));
        assert_eq!(
            state.registry.get(cluster.b).unwrap().owned_paths,
            vec!["/b".to_string()],
            "shadow copies are not owned by the backup"
        );
    }

    #[tokio::test]
    async fn test_snapshot_skips_unreachable_backup() {
        let namespace = Namespace::new(5, 3);
        let transport = Arc::new(MemoryTransport::default());
        let manager = ReplicationManager::new(transport.clone());
        transport.put(addr(A_ADDR), "/f", b"x");
        transport.set_unreachable(addr(C_ADDR));

        let assigned = {
            let mut state = namespace.lock().await;
            state.register(addr(A_ADDR), None, &[("/f".into(), false)]);
            state.register(addr(B_ADDR), None, &[]);
            let c = state.register(addr(C_ADDR), None, &[]).id();
            state.registry.assign_backups(c)
        };

        let recorded = manager.snapshot(&namespace, &assigned).await;

        assert_eq!(recorded, 1);
        let state = namespace.lock().await;
        assert!(state.trie.lookup("#backup2/f").is_none());
    }

    // ============================================================
    // FAILOVER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_backup_answers_when_primary_down() {
        let cluster = cluster().await;
        let mut state = cluster.namespace.lock().await;

        state.node_down(cluster.a);

        assert_eq!(
            state.resolve("/a/f1.txt"),
            Some(Resolution::Backup {
                slot: 0,
                node: cluster.b
            })
        );
        assert_eq!(state.cache.len(), 0, "backup answers are not cached");
    }

    #[tokio::test]
    async fn test_second_backup_answers_when_first_also_down() {
        let cluster = cluster().await;
        let mut state = cluster.namespace.lock().await;

        state.node_down(cluster.a);
        state.node_down(cluster.b);

        assert_eq!(
            state.resolve("/a/f1.txt"),
            Some(Resolution::Backup {
                slot: 1,
                node: cluster.c
            })
        );
    }

    // ============================================================
    // MIRRORING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_mirror_write_updates_every_backup() {
        let cluster = cluster().await;
        cluster
            .transport
            .put(addr(A_ADDR), "/a/f1.txt", b"second version");

        let mirrored = cluster
            .manager
            .mirror_write(&cluster.namespace, "/a/f1.txt", cluster.a)
            .await;

        assert_eq!(mirrored, 2);
        for backup in [B_ADDR, C_ADDR] {
            assert_eq!(
                cluster.transport.file(addr(backup), "/a/f1.txt").as_deref(),
                Some(&b"second version"[..])
            );
        }
    }

    #[tokio::test]
    async fn test_mirror_failure_is_tolerated() {
        let cluster = cluster().await;
        cluster.transport.set_unreachable(addr(C_ADDR));

        let mirrored = cluster
            .manager
            .mirror_write(&cluster.namespace, "/a/f1.txt", cluster.a)
            .await;

        assert_eq!(mirrored, 1);
    }

    #[tokio::test]
    async fn test_mirror_skips_down_backup() {
        let cluster = cluster().await;
        cluster.namespace.lock().await.node_down(cluster.c);
        let before = cluster.transport.stores().len();

        let mirrored = cluster
            .manager
            .mirror_write(&cluster.namespace, "/a/f1.txt", cluster.a)
            .await;

        assert_eq!(mirrored, 1);
        let after = cluster.transport.stores();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last().unwrap().0, addr(B_ADDR));
    }

    // ============================================================
    // COPY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_copy_file_into_directory() {
        let cluster = cluster().await;

        let targets = cluster
            .manager
            .copy(&cluster.namespace, "/a/f1.txt", "/b")
            .await
            .expect("copy succeeds");

        assert_eq!(targets, vec!["/b/f1.txt".to_string()]);
        assert_eq!(
            cluster.transport.file(addr(B_ADDR), "/b/f1.txt").as_deref(),
            Some(&b"hello"[..])
        );

        let mut state = cluster.namespace.lock().await;
        assert_eq!(state.resolve("/b/f1.txt"), Some(Resolution::Primary(cluster.b)));
        assert!(
            state
                .registry
                .get(cluster.b)
                .unwrap()
                .owned_paths
                .contains(&"/b/f1.txt".to_string())
        );
    }

    #[tokio::test]
    async fn test_copy_file_onto_file_overwrites() {
        let cluster = cluster().await;
        cluster.transport.put(addr(B_ADDR), "/b/old.txt", b"old");
        cluster
            .namespace
            .lock()
            .await
            .apply(vec![crate::naming::namespace::PathRecord::primary(
                "/b/old.txt",
                cluster.b,
                false,
            )]);

        cluster
            .manager
            .copy(&cluster.namespace, "/a/f1.txt", "/b/old.txt")
            .await
            .expect("copy succeeds");

        assert_eq!(
            cluster.transport.file(addr(B_ADDR), "/b/old.txt").as_deref(),
            Some(&b"hello"[..])
        );
    }

    #[tokio::test]
    async fn test_copy_directory_onto_file_is_rejected() {
        let cluster = cluster().await;

        let result = cluster
            .manager
            .copy(&cluster.namespace, "/a", "/a/f1.txt")
            .await;

        assert!(matches!(result, Err(FsError::InvalidCopy(_))));
    }

    #[tokio::test]
    async fn test_copy_directory_merges_tree() {
        let cluster = cluster().await;

        let targets = cluster
            .manager
            .copy(&cluster.namespace, "/a", "/b")
            .await
            .expect("copy succeeds");

        assert_eq!(targets, vec!["/b".to_string(), "/b/f1.txt".to_string()]);
        assert!(cluster.transport.has_dir(addr(B_ADDR), "/b"));

        let state = cluster.namespace.lock().await;
        assert_eq!(
            state.trie.resolve("#backup1/b/f1.txt", |_| true),
            state.registry.get(cluster.b).unwrap().backups[0],
            "copied entries are mirrored to the destination's backups"
        );
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_not_found() {
        let cluster = cluster().await;

        let result = cluster
            .manager
            .copy(&cluster.namespace, "/nope", "/b")
            .await;

        assert!(matches!(result, Err(FsError::NotFound(_))));
    }
}
