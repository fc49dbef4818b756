//! Storage Node Tests
//!
//! Runs against real temporary directories. Most tests call the node's
//! components directly; the loopback tests start a naming server and a
//! storage node on ephemeral ports and talk to them over TCP.
//!
//! ## Test Scopes
//! - **Protocol**: request framing.
//! - **Access**: fail-fast reader/writer gate.
//! - **Local store**: listing, info, recursive delete.
//! - **Writes**: sync and async paths, notices, busy answers.
//! - **Loopback**: registration, async completion forwarding, control commands.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::config::{NamingConfig, StorageConfig, WritePolicy};
    use crate::error::{Activity, FsError};
    use crate::membership::types::ControlCommand;
    use crate::naming::coordinator::NamingService;
    use crate::naming::protocol::{NodeEvent, parse_location, replies as naming_replies};
    use crate::replication::peer::TcpPeerTransport;
    use crate::storage::access::FileAccessController;
    use crate::storage::local::LocalStore;
    use crate::storage::protocol::{
        STORE_OK, StorageRequest, TERMINATOR, encode_payload, encode_write, parse_request,
        read_request, replies,
    };
    use crate::storage::server::{self, StorageServer};
    use crate::storage::writer::{WriteOutcome, WritePipeline};

    fn policy(async_threshold: usize, chunk_size: usize, chunk_delay_ms: u64) -> WritePolicy {
        WritePolicy {
            async_threshold,
            chunk_size,
            chunk_delay: Duration::from_millis(chunk_delay_ms),
        }
    }

    fn node(policy: WritePolicy) -> (TempDir, Arc<StorageServer>, UnboundedReceiver<NodeEvent>) {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (dir, StorageServer::new(store, policy, tx), rx)
    }

    async fn respond(server: &StorageServer, request: StorageRequest) -> String {
        let mut out = Vec::new();
        server.respond(request, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn next_event(events: &mut UnboundedReceiver<NodeEvent>) -> NodeEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    /// Collects notices until the terminal one of an async write.
    async fn until_done(events: &mut UnboundedReceiver<NodeEvent>) -> (usize, NodeEvent) {
        let mut progress = 0;
        loop {
            match next_event(events).await {
                NodeEvent::AsyncProgress { .. } => progress += 1,
                done => return (progress, done),
            }
        }
    }

    fn write(path: &str, data: &[u8], sync: bool, request: Option<u64>) -> StorageRequest {
        StorageRequest::Write {
            path: path.to_string(),
            data: data.to_vec(),
            sync,
            request,
        }
    }

    // ============================================================
    // PROTOCOL
    // ============================================================

    #[test]
    fn test_parse_write_with_flags() {
        let request = parse_request(b"WRITE --SYNC --ID 42 /a/b.txt hello world EOF\n").unwrap();
        assert_eq!(request, write("/a/b.txt", b"hello world", true, Some(42)));

        let request = parse_request(b"WRITE /f.txt EOF\n").unwrap();
        assert_eq!(request, write("/f.txt", b"", false, None));
    }

    #[test]
    fn test_parse_simple_requests() {
        assert_eq!(
            parse_request(b"READ /a.txt\n").unwrap(),
            StorageRequest::Read {
                path: "/a.txt".into()
            }
        );
        assert_eq!(
            parse_request(b"STORE_DIR /d/\n").unwrap(),
            StorageRequest::StoreDir { path: "/d".into() }
        );
        assert!(matches!(
            parse_request(b"READ ../etc/passwd\n"),
            Err(FsError::Protocol(_))
        ));
        assert!(matches!(parse_request(b"RENAME /a\n"), Err(FsError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_payload_spans_lines_until_eof() {
        let mut input: &[u8] = b"WRITE --ID 7 /poem.txt first line\nsecond line\nlast EOF\n";
        let request = read_request(&mut input).await.unwrap().unwrap();
        assert_eq!(
            request,
            write("/poem.txt", b"first line\nsecond line\nlast", false, Some(7))
        );
    }

    #[tokio::test]
    async fn test_encoded_write_survives_framing() {
        let content = b"line one\nline two\n";
        let encoded = encode_write("/x.txt", content, false, Some(3));
        let mut input: &[u8] = &encoded;
        let request = read_request(&mut input).await.unwrap().unwrap();
        assert_eq!(request, write("/x.txt", content, false, Some(3)));

        let mut input: &[u8] = &encode_payload("STORE", "/copy.txt", b"");
        assert_eq!(
            read_request(&mut input).await.unwrap().unwrap(),
            StorageRequest::Store {
                path: "/copy.txt".into(),
                data: Vec::new()
            }
        );
    }

    #[tokio::test]
    async fn test_content_with_eof_lines_is_kept_whole() {
        let content = b"header\nsection EOF\ntrailer EOF\n";

        let mut input: &[u8] = &encode_payload("STORE", "/r.txt", content);
        assert_eq!(
            read_request(&mut input).await.unwrap().unwrap(),
            StorageRequest::Store {
                path: "/r.txt".into(),
                data: content.to_vec()
            }
        );

        let encoded = encode_write("/w.txt", content, true, Some(9));
        assert_eq!(
            parse_request(&encoded).unwrap(),
            write("/w.txt", content, true, Some(9))
        );
    }

    #[tokio::test]
    async fn test_length_framed_payload_must_be_complete() {
        let mut short: &[u8] = b"STORE --LEN 20 /r.txt only a few\n";
        assert!(matches!(
            read_request(&mut short).await,
            Err(FsError::Protocol(_))
        ));

        let mut unclosed: &[u8] = b"STORE --LEN 2 /r.txt abcd EOF\n";
        assert!(matches!(
            read_request(&mut unclosed).await,
            Err(FsError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unterminated_payload_is_rejected() {
        let mut input: &[u8] = b"WRITE /a.txt never ends\n";
        assert!(matches!(
            read_request(&mut input).await,
            Err(FsError::Protocol(_))
        ));

        let mut empty: &[u8] = b"";
        assert!(read_request(&mut empty).await.unwrap().is_none());
    }

    // ============================================================
    // ACCESS GATE
    // ============================================================

    #[test]
    fn test_readers_share_and_block_writers() {
        let access = FileAccessController::new();
        let first = access.try_begin_read("/f").unwrap();
        let second = access.try_begin_read("/f").unwrap();
        assert_eq!(access.state("/f").readers, 2);

        assert!(matches!(
            access.try_begin_write("/f"),
            Err(FsError::Busy(Activity::Read, _))
        ));

        drop(first);
        drop(second);
        assert_eq!(access.tracked(), 0);
        assert!(access.try_begin_write("/f").is_ok());
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let access = FileAccessController::new();
        let guard = access.try_begin_write("/f").unwrap();
        guard.set_async(9);
        assert_eq!(access.state("/f").pending_async, Some(9));

        assert!(matches!(
            access.try_begin_read("/f"),
            Err(FsError::Busy(Activity::Write, _))
        ));
        assert!(matches!(
            access.try_begin_write("/f"),
            Err(FsError::Busy(Activity::Write, _))
        ));
        // Other files are independent.
        assert!(access.try_begin_write("/g").is_ok());

        drop(guard);
        assert!(access.try_begin_read("/f").is_ok());
        assert_eq!(access.state("/f").pending_async, None);
    }

    #[test]
    fn test_ensure_idle_covers_descendants() {
        let access = FileAccessController::new();
        let _reader = access.try_begin_read("/dir/inner/file.txt").unwrap();

        assert!(access.ensure_idle("/dir").is_err());
        assert!(access.ensure_idle("/dir/inner").is_err());
        assert!(access.ensure_idle("/di").is_ok());
        assert!(access.ensure_idle("/other").is_ok());
    }

    // ============================================================
    // LOCAL STORE
    // ============================================================

    #[tokio::test]
    async fn test_listing_orders_parents_first() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        std::fs::write(dir.path().join("b/inner/deep.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let store = LocalStore::open(dir.path()).unwrap();
        let listing = store.listing().unwrap();
        assert_eq!(
            listing,
            vec![
                ("/a.txt".to_string(), false),
                ("/b".to_string(), true),
                ("/b/inner".to_string(), true),
                ("/b/inner/deep.txt".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_store_round_trip_and_recursive_delete() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        store.write("/docs/readme.txt", b"hello").await.unwrap();
        assert_eq!(store.read("/docs/readme.txt").await.unwrap(), b"hello");

        let info = store.info("/docs/readme.txt").await.unwrap();
        assert!(info.contains("File size: 5 bytes"));
        assert!(info.contains("File type: Regular file"));

        store.create_file("/docs/readme.txt").await.unwrap();
        assert_eq!(store.read("/docs/readme.txt").await.unwrap(), b"hello");

        store.delete("/docs").await.unwrap();
        assert!(!dir.path().join("docs").exists());
        assert!(matches!(
            store.read("/docs/readme.txt").await,
            Err(FsError::NotFound(_))
        ));
        assert!(store.locate("/../escape").is_err());
    }

    // ============================================================
    // WRITES
    // ============================================================

    #[tokio::test]
    async fn test_small_write_is_synchronous() {
        let (dir, server, mut events) = node(policy(10, 4, 0));

        let reply = respond(&server, write("/small.txt", b"tiny", false, Some(1))).await;
        assert_eq!(reply, format!("{}\n", replies::WRITTEN));
        assert_eq!(std::fs::read(dir.path().join("small.txt")).unwrap(), b"tiny");
        assert_eq!(
            next_event(&mut events).await,
            NodeEvent::WriteSuccess {
                request: Some(1),
                path: "/small.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_sync_flag_overrides_threshold() {
        let (dir, server, mut events) = node(policy(4, 2, 0));

        let reply = respond(&server, write("/big.txt", b"much more than four", true, Some(2))).await;
        assert_eq!(reply, format!("{}\n", replies::WRITTEN));
        assert_eq!(
            std::fs::read(dir.path().join("big.txt")).unwrap(),
            b"much more than four"
        );
        assert!(matches!(
            next_event(&mut events).await,
            NodeEvent::WriteSuccess {
                request: Some(2),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_large_write_completes_in_background_exactly_once() {
        let (dir, server, mut events) = node(policy(4, 4, 0));

        let reply = respond(&server, write("/large.txt", b"0123456789", false, Some(77))).await;
        assert_eq!(reply, format!("{}\n", replies::ACCEPTED));

        let (progress, done) = until_done(&mut events).await;
        assert_eq!(progress, 3);
        assert_eq!(
            done,
            NodeEvent::AsyncSuccess {
                request: 77,
                path: "/large.txt".into()
            }
        );
        assert_eq!(
            std::fs::read(dir.path().join("large.txt")).unwrap(),
            b"0123456789"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(server.access().tracked(), 0);
    }

    #[tokio::test]
    async fn test_gate_held_for_whole_async_write() {
        let (_dir, server, mut events) = node(policy(4, 2, 40));

        let reply = respond(&server, write("/slow.txt", b"abcdefgh", false, Some(5))).await;
        assert_eq!(reply, format!("{}\n", replies::ACCEPTED));
        assert_eq!(server.access().state("/slow.txt").pending_async, Some(5));

        let blocked = respond(
            &server,
            StorageRequest::Read {
                path: "/slow.txt".into(),
            },
        )
        .await;
        assert_eq!(blocked, format!("{}\n", replies::READ_BLOCKED));

        let second = respond(&server, write("/slow.txt", b"x", true, None)).await;
        assert_eq!(second, format!("{}\n", naming_replies::WRITE_BUSY));

        let refused = respond(&server, write("/slow.txt", b"y", true, Some(6))).await;
        assert_eq!(refused, format!("{}\n", naming_replies::WRITE_BUSY));
        let mut released = false;
        let done = loop {
            match next_event(&mut events).await {
                NodeEvent::AsyncProgress { .. } => {}
                NodeEvent::WriteFail {
                    request: Some(6), ..
                } => released = true,
                other => break other,
            }
        };
        assert!(released, "a refused write still answers upstream");
        assert!(matches!(done, NodeEvent::AsyncSuccess { request: 5, .. }));

        let read = respond(
            &server,
            StorageRequest::Read {
                path: "/slow.txt".into(),
            },
        )
        .await;
        assert_eq!(read, format!("abcdefgh{}", TERMINATOR));
    }

    #[tokio::test]
    async fn test_failed_writes_report_failure() {
        let (dir, server, mut events) = node(policy(4, 4, 0));
        std::fs::create_dir(dir.path().join("taken")).unwrap();

        let reply = respond(&server, write("/taken", b"ab", false, None)).await;
        assert!(reply.starts_with("ERROR: "));
        assert!(matches!(
            next_event(&mut events).await,
            NodeEvent::WriteFail { request: None, .. }
        ));

        let reply = respond(&server, write("/taken", b"long enough", false, Some(8))).await;
        assert_eq!(reply, format!("{}\n", replies::ACCEPTED));
        let (progress, done) = until_done(&mut events).await;
        assert_eq!(progress, 0);
        assert_eq!(
            done,
            NodeEvent::AsyncFail {
                request: 8,
                path: "/taken".into()
            }
        );
        assert_eq!(server.access().tracked(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_decides_path_by_size() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pipeline = WritePipeline::new(store, FileAccessController::new(), policy(10, 4, 0), tx);

        assert!(!pipeline.is_async(10, false));
        assert!(pipeline.is_async(11, false));
        assert!(!pipeline.is_async(11, true));
        assert_eq!(
            pipeline.write("/p.txt", b"ok".to_vec(), false, None).await.unwrap(),
            WriteOutcome::Written
        );
    }

    // ============================================================
    // PEER COPY AND CONTROL COMMANDS
    // ============================================================

    #[tokio::test]
    async fn test_store_and_fetch_for_peers() {
        let (dir, server, mut events) = node(WritePolicy::default());

        let stored = respond(
            &server,
            StorageRequest::Store {
                path: "/replica/a.txt".into(),
                data: b"copied".to_vec(),
            },
        )
        .await;
        assert_eq!(stored, format!("{}\n", STORE_OK));
        assert_eq!(
            std::fs::read(dir.path().join("replica/a.txt")).unwrap(),
            b"copied"
        );

        let fetched = respond(
            &server,
            StorageRequest::Fetch {
                path: "/replica/a.txt".into(),
            },
        )
        .await;
        assert_eq!(fetched, format!("copied{}", TERMINATOR));

        let missing = respond(
            &server,
            StorageRequest::Fetch {
                path: "/nope".into(),
            },
        )
        .await;
        assert!(missing.starts_with("ERROR: "));

        // Replica traffic is never reported upstream.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_commands_apply_locally() {
        let (dir, server, _events) = node(WritePolicy::default());

        assert!(server.apply(ControlCommand::CreateDir("/d".into())).await);
        assert!(server.apply(ControlCommand::CreateFile("/d/f.txt".into())).await);
        assert!(dir.path().join("d/f.txt").is_file());

        let reader = server.access().try_begin_read("/d/f.txt").unwrap();
        assert!(server.apply(ControlCommand::Delete("/d".into())).await);
        assert!(dir.path().join("d/f.txt").exists());

        drop(reader);
        assert!(server.apply(ControlCommand::Delete("/d".into())).await);
        assert!(!dir.path().join("d").exists());

        assert!(!server.apply(ControlCommand::Stop).await);
    }

    // ============================================================
    // LOOPBACK
    // ============================================================

    struct Cluster {
        service: Arc<NamingService>,
        naming: std::net::SocketAddr,
        storage: std::net::SocketAddr,
        leave: watch::Sender<bool>,
        node: JoinHandle<anyhow::Result<()>>,
    }

    async fn cluster(root: &Path, tune: impl FnOnce(&mut StorageConfig)) -> Cluster {
        let naming_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let naming = naming_listener.local_addr().unwrap();
        let transport = Arc::new(TcpPeerTransport::new(Duration::from_secs(2)));
        let service = NamingService::new(NamingConfig::default(), transport);
        tokio::spawn(crate::naming::server::serve(service.clone(), naming_listener));

        let storage_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let storage = storage_listener.local_addr().unwrap();
        let mut config = StorageConfig::new(naming, storage, root.to_path_buf());
        tune(&mut config);

        let (leave, leaving) = watch::channel(false);
        let node = tokio::spawn(server::start(config, storage_listener, leaving));

        for _ in 0..200 {
            if !service.nodes().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.nodes().await.len(), 1);

        Cluster {
            service,
            naming,
            storage,
            leave,
            node,
        }
    }

    async fn client(
        naming: std::net::SocketAddr,
    ) -> (
        tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        let stream = TcpStream::connect(naming).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        writer.write_all(b"CLIENT\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            naming_replies::CONNECTED
        );
        (lines, writer)
    }

    #[tokio::test]
    async fn test_loopback_async_write_reaches_client() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"old").unwrap();
        let cluster = cluster(dir.path(), |config| {
            config.async_threshold = 4;
            config.chunk_size = 2;
        })
        .await;

        let (mut lines, mut writer) = client(cluster.naming).await;
        writer.write_all(b"WRITE /notes.txt\n").await.unwrap();
        let location = lines.next_line().await.unwrap().unwrap();
        let (addr, request) = parse_location(&location).unwrap();
        assert_eq!(addr, cluster.storage);
        let request = request.expect("writes carry a request id");

        let mut data = TcpStream::connect(addr).await.unwrap();
        data.write_all(&encode_write("/notes.txt", b"fresh content", false, Some(request)))
            .await
            .unwrap();
        let mut ack = String::new();
        data.read_to_string(&mut ack).await.unwrap();
        assert_eq!(ack.trim_end(), replies::ACCEPTED);

        let done = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done, "ASYNC_WRITE_SUCCESS /notes.txt");
        assert_eq!(
            std::fs::read(dir.path().join("notes.txt")).unwrap(),
            b"fresh content"
        );

        cluster.leave.send(true).unwrap();
        cluster.node.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_loopback_create_and_delete_reach_disk() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        let cluster = cluster(dir.path(), |_| {}).await;

        let (mut lines, mut writer) = client(cluster.naming).await;
        writer.write_all(b"CREATE_FILE /docs/new.txt\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            naming_replies::FILE_CREATED
        );

        let created = dir.path().join("docs/new.txt");
        for _ in 0..200 {
            if created.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(created.is_file());

        writer.write_all(b"DELETE /docs\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            naming_replies::DELETED
        );
        for _ in 0..200 {
            if !dir.path().join("docs").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dir.path().join("docs").exists());

        cluster.leave.send(true).unwrap();
        cluster.node.await.unwrap().unwrap();
        assert_eq!(cluster.service.nodes().await.len(), 1);
    }
}
