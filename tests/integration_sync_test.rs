//! Full integrity cycle against a live master handler: the test plays the
//! worker side of the wire, uploads its index, receives the master's reply
//! bundle, and applies it.

use bytes::Bytes;
use dashmap::DashMap;
use sentra::config::{Config, Intervals};
use sentra::core::SentraError;
use sentra::core::cluster::NodeType;
use sentra::core::cluster::master::{MasterSessionHandler, MasterState};
use sentra::core::dispatch::{EmptyDirectory, FunctionRegistry};
use sentra::core::session::{RequestDispatcher, Session, dispatch_common, tasks, transfer};
use sentra::core::sync::bundle::{IntegrityReply, SyncBundle, compress, decompress, stage};
use sentra::core::sync::manifest::ClusterItems;
use sentra::core::sync::scanner::scan_files;
use sentra::core::sync::{SourceKind, apply};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MANIFEST: &str = r#"{
    "files": {
        "/etc/": {
            "recursive": true,
            "files": ["all"],
            "source": "master",
            "umask": "0o117",
            "write_mode": "atomic"
        }
    },
    "excluded_files": []
}"#;

/// The worker end of the wire, just deep enough to receive the master's
/// integrity reply.
struct ReplyCollector {
    dir: PathBuf,
    receptions: DashMap<String, oneshot::Receiver<Result<PathBuf, SentraError>>>,
    reply_tx: mpsc::Sender<PathBuf>,
    clean_tx: mpsc::Sender<()>,
}

#[async_trait::async_trait]
impl RequestDispatcher for ReplyCollector {
    async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        payload: Bytes,
    ) -> Result<Option<(String, Bytes)>, SentraError> {
        match command {
            "sync_m_c" => {
                let (task_id, rx) = session.tasks().register(command, None);
                let dest = self.dir.join(format!("{task_id}.reply"));
                let (done_tx, done_rx) = oneshot::channel();
                let registry_session = session.clone();
                let registry_task_id = task_id.clone();
                tokio::spawn(async move {
                    let result = tasks::receive_file(rx, dest, Duration::from_secs(10)).await;
                    registry_session.tasks().remove(&registry_task_id);
                    let _ = done_tx.send(result);
                });
                self.receptions.insert(task_id.clone(), done_rx);
                Ok(Some(("ok".to_string(), Bytes::from(task_id))))
            }
            "sync_m_c_e" => {
                let text = std::str::from_utf8(&payload)?;
                let task_id = text.split(' ').next().unwrap_or_default().to_string();
                let (_, done_rx) = self
                    .receptions
                    .remove(&task_id)
                    .ok_or_else(|| SentraError::TaskNotFound(task_id))?;
                let path = done_rx
                    .await
                    .map_err(|_| SentraError::TransportClosed)??;
                let _ = self.reply_tx.send(path).await;
                Ok(Some(("ok".to_string(), Bytes::from_static(b"File correctly received"))))
            }
            "sync_m_c_ok" => {
                let _ = self.clean_tx.send(()).await;
                Ok(Some(("ok".to_string(), Bytes::from_static(b"Thanks"))))
            }
            _ => dispatch_common(session, command, payload).await,
        }
    }
}

fn write(root: &Path, relpath: &str, content: &str) {
    let path = root.join(relpath);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn master_config(data_dir: PathBuf) -> Config {
    Config {
        name: "prod".to_string(),
        node_name: "master-node".to_string(),
        node_type: NodeType::Master,
        key: None,
        bind_addr: "127.0.0.1".to_string(),
        port: 1516,
        nodes: vec![],
        data_dir,
        manifest_path: "cluster.json".into(),
        control_socket: "control.sock".into(),
        log_level: "info".to_string(),
        interval: Intervals {
            file_transfer_send: Duration::ZERO,
            string_transfer_send: Duration::ZERO,
            ..Intervals::default()
        },
        max_time_receiving_file: Duration::from_secs(10),
        max_time_receiving_string: Duration::from_secs(10),
        request_timeout: Duration::from_secs(10),
    }
}

async fn run_worker_cycle(
    session: &Arc<Session>,
    worker_root: &Path,
    manifest: &ClusterItems,
) -> Result<(), SentraError> {
    let permission = session
        .execute_str("sync_i_w_m_p", "")
        .await?
        .into_result()?;
    assert_eq!(permission.as_ref(), b"true");

    let index = scan_files(worker_root, manifest, SourceKind::Master, NodeType::Worker, true)?;
    let upload = SyncBundle {
        node_name: "worker-1".to_string(),
        index,
        files: Default::default(),
    };
    let staged = stage(worker_root, "worker-1", "integrity", &compress(&upload)?)?;
    let task_id = transfer::send_file(
        session,
        "sync_i_w_m",
        Bytes::from_static(b"integrity.bundle"),
        &staged,
        Duration::ZERO,
    )
    .await?;
    session
        .execute_str("sync_i_w_m_e", &format!("{task_id} integrity.bundle"))
        .await?
        .into_result()?;
    Ok(())
}

#[tokio::test]
async fn test_integrity_cycle_converges_worker_to_master() {
    let master_dir = tempfile::tempdir().unwrap();
    let worker_dir = tempfile::tempdir().unwrap();
    let manifest = ClusterItems::from_json(MANIFEST).unwrap();

    // Master: a (same), b (differs), c (worker lacks it).
    write(master_dir.path(), "etc/a.conf", "alpha");
    write(master_dir.path(), "etc/b.conf", "master copy of b");
    write(master_dir.path(), "etc/c.conf", "only the master has c");
    // Worker: a (same), b (stale).
    write(worker_dir.path(), "etc/a.conf", "alpha");
    write(worker_dir.path(), "etc/b.conf", "worker copy of b");

    let state = MasterState::new(
        Arc::new(master_config(master_dir.path().to_path_buf())),
        Arc::new(manifest.clone()),
        Arc::new(FunctionRegistry::new()),
        Arc::new(EmptyDirectory),
    );

    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    let (clean_tx, _clean_rx) = mpsc::channel(1);
    let (a, b) = tokio::io::duplex(1 << 20);
    let handler = Arc::new(MasterSessionHandler::new(state.clone(), "10.0.0.7".into()));
    let _ = Session::spawn(a, None, handler, "master");
    let (worker_session, _) = Session::spawn(
        b,
        None,
        Arc::new(ReplyCollector {
            dir: worker_dir.path().to_path_buf(),
            receptions: DashMap::new(),
            reply_tx,
            clean_tx,
        }),
        "worker",
    );

    let version = env!("CARGO_PKG_VERSION");
    worker_session
        .notify("hello", Bytes::from(format!("worker-1 prod worker {version}")))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !state.workers.contains_key("worker-1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    run_worker_cycle(&worker_session, worker_dir.path(), &manifest)
        .await
        .unwrap();

    // The master streams its reply bundle back.
    let reply_path = tokio::time::timeout(Duration::from_secs(10), reply_rx.recv())
        .await
        .expect("master must send its integrity reply")
        .unwrap();
    let reply: IntegrityReply = decompress(&std::fs::read(&reply_path).unwrap()).unwrap();

    let shared: Vec<_> = reply.classified.shared.keys().cloned().collect();
    let missing: Vec<_> = reply.classified.missing.keys().cloned().collect();
    assert_eq!(shared, vec!["/etc/b.conf".to_string()]);
    assert_eq!(missing, vec!["/etc/c.conf".to_string()]);
    assert!(reply.classified.extra.is_empty());

    // Applying the reply converges the worker onto the master's tree.
    let counters = apply::apply_integrity_reply(
        worker_dir.path(),
        &manifest,
        &reply,
        NodeType::Worker,
        None,
    );
    assert_eq!(counters.total_errors(), 0);
    assert_eq!(
        std::fs::read(worker_dir.path().join("etc/b.conf")).unwrap(),
        b"master copy of b"
    );
    assert_eq!(
        std::fs::read(worker_dir.path().join("etc/c.conf")).unwrap(),
        b"only the master has c"
    );

    // The permission gate reopens once the cycle completes.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let peer = state.workers.get("worker-1").unwrap();
            let free = peer.status.lock().sync_integrity_free;
            if free {
                let report = peer.status.lock().last_sync_integrity.clone();
                assert_eq!(report.total_files.shared, 1);
                assert_eq!(report.total_files.missing, 1);
                return;
            }
            drop(peer);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("integrity gate must be restored");
}
