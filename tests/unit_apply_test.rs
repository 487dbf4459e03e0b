use sentra::core::SentraError;
use sentra::core::cluster::NodeType;
use sentra::core::sync::apply::{AgentRemovalHook, apply_agent_info, apply_integrity_reply, update_file};
use sentra::core::sync::bundle::IntegrityReply;
use sentra::core::sync::manifest::ClusterItems;
use sentra::core::sync::scanner::FileMeta;
use sentra::core::sync::{Classified, WriteMode};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

const MANIFEST: &str = r#"{
    "files": {
        "/etc/": {
            "recursive": true,
            "files": ["all"],
            "source": "master",
            "umask": "0o117",
            "write_mode": "atomic"
        },
        "/queue/agent-groups/": {
            "recursive": false,
            "files": ["all"],
            "source": "worker",
            "umask": "0o117",
            "write_mode": "atomic",
            "remove_subdirs_if_empty": true,
            "extra_valid": true
        }
    },
    "excluded_files": []
}"#;

fn meta(write_mode: WriteMode, mtime: i64) -> FileMeta {
    FileMeta {
        digest: String::new(),
        mtime,
        size: 0,
        umask: 0o117,
        write_mode,
        merged: false,
        merge_type: None,
        cluster_item_key: "/etc/".to_string(),
    }
}

#[test]
fn test_atomic_apply_creates_parents_and_restores_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    update_file(
        root,
        "/etc/rules/new.xml",
        b"<rules/>",
        &meta(WriteMode::Atomic, 1_600_000_000),
        NodeType::Worker,
        None,
    )
    .unwrap();

    let dest = root.join("etc/rules/new.xml");
    assert_eq!(std::fs::read(&dest).unwrap(), b"<rules/>");
    // No temp file left behind.
    assert!(!root.join("etc/rules/new.xml.tmp.cluster").exists());
    // Umask applied: 0o666 & !0o117 == 0o660.
    let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o660);
    // Source mtime restored.
    let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&dest).unwrap());
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);
}

#[test]
fn test_client_keys_rejected_on_master() {
    let dir = tempfile::tempdir().unwrap();
    let err = update_file(
        dir.path(),
        "/etc/client.keys",
        b"001 agent1 any KEY\n",
        &meta(WriteMode::Atomic, 1_600_000_000),
        NodeType::Master,
        None,
    )
    .unwrap_err();
    assert_eq!(err, SentraError::ClientKeysOnMaster);
    assert!(!dir.path().join("etc/client.keys").exists());
}

#[test]
fn test_client_keys_removal_fires_agent_hook() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("etc")).unwrap();
    std::fs::write(
        root.join("etc/client.keys"),
        "001 agent1 any KEY\n002 agent2 10.0.0.2 KEY2\n",
    )
    .unwrap();

    let removed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    let hook: AgentRemovalHook = Arc::new(move |agent_id| {
        sink.lock().unwrap().push(agent_id.to_string());
    });

    // The new client.keys lacks agent 001.
    update_file(
        root,
        "/etc/client.keys",
        b"002 agent2 10.0.0.2 KEY2\n",
        &meta(WriteMode::Atomic, 1_600_000_000),
        NodeType::Worker,
        Some(&hook),
    )
    .unwrap();

    assert_eq!(removed.lock().unwrap().as_slice(), ["001".to_string()]);
}

#[test]
fn test_agent_info_guards() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    // Workers never accept agent status files.
    let err = update_file(
        root,
        "/queue/agent-info/agent-001",
        b"heartbeat",
        &meta(WriteMode::Inline, 1_600_000_000),
        NodeType::Worker,
        None,
    )
    .unwrap_err();
    assert_eq!(err, SentraError::AgentInfoOnWorker);

    // Masters accept fresh records...
    update_file(
        root,
        "/queue/agent-info/agent-001",
        b"heartbeat",
        &meta(WriteMode::Inline, 1_600_000_000),
        NodeType::Master,
        None,
    )
    .unwrap();

    // ...but refuse records older than the current file, with the distinct
    // stale code so the sender discards instead of retrying.
    let err = update_file(
        root,
        "/queue/agent-info/agent-001",
        b"older heartbeat",
        &meta(WriteMode::Inline, 1_500_000_000),
        NodeType::Master,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, SentraError::StaleAgentInfo(_)));
    assert_eq!(err.code(), 3012);
    assert_eq!(
        std::fs::read(root.join("queue/agent-info/agent-001")).unwrap(),
        b"heartbeat"
    );
}

#[test]
fn test_apply_agent_info_counts_stale_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("queue/agent-info")).unwrap();
    std::fs::write(root.join("queue/agent-info/agent-002"), b"current").unwrap();

    let mut index = BTreeMap::new();
    let mut files = BTreeMap::new();
    let mut fresh = meta(WriteMode::Inline, sentra::core::sync::scanner::unix_now());
    fresh.cluster_item_key = "/queue/agent-info/".to_string();
    let mut stale = fresh.clone();
    stale.mtime = 1_000_000_000;

    index.insert("/queue/agent-info/agent-001".to_string(), fresh);
    files.insert("/queue/agent-info/agent-001".to_string(), b"fresh".to_vec());
    index.insert("/queue/agent-info/agent-002".to_string(), stale);
    files.insert("/queue/agent-info/agent-002".to_string(), b"stale".to_vec());

    let (applied, discarded) = apply_agent_info(root, &files, &index);
    assert_eq!((applied, discarded), (1, 1));
    assert_eq!(
        std::fs::read(root.join("queue/agent-info/agent-001")).unwrap(),
        b"fresh"
    );
    assert_eq!(
        std::fs::read(root.join("queue/agent-info/agent-002")).unwrap(),
        b"current"
    );
}

#[test]
fn test_integrity_reply_apply_updates_removes_and_prunes() {
    let manifest = ClusterItems::from_json(MANIFEST).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("etc")).unwrap();
    std::fs::write(root.join("etc/b.conf"), b"worker version").unwrap();
    std::fs::create_dir_all(root.join("queue/agent-groups")).unwrap();
    std::fs::write(root.join("queue/agent-groups/foo"), b"stale group").unwrap();

    let mut classified = Classified::default();
    classified
        .shared
        .insert("/etc/b.conf".to_string(), meta(WriteMode::Atomic, 1_600_000_000));
    classified
        .missing
        .insert("/etc/c.conf".to_string(), meta(WriteMode::Atomic, 1_600_000_100));
    classified.extra.push("/queue/agent-groups/foo".to_string());

    let mut reply = IntegrityReply {
        classified,
        ..Default::default()
    };
    reply.files.insert("/etc/b.conf".to_string(), b"master version".to_vec());
    reply.files.insert("/etc/c.conf".to_string(), b"brand new".to_vec());

    let counters = apply_integrity_reply(root, &manifest, &reply, NodeType::Worker, None);
    assert_eq!(counters.updated, 2);
    assert_eq!(counters.removed, 1);
    assert_eq!(counters.total_errors(), 0);

    assert_eq!(std::fs::read(root.join("etc/b.conf")).unwrap(), b"master version");
    assert_eq!(std::fs::read(root.join("etc/c.conf")).unwrap(), b"brand new");
    assert!(!root.join("queue/agent-groups/foo").exists());
    // The now-empty directory is pruned because the manifest flags it.
    assert!(!root.join("queue/agent-groups").exists());
}

#[test]
fn test_apply_continues_past_individual_failures() {
    let manifest = ClusterItems::from_json(MANIFEST).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let mut classified = Classified::default();
    // Listed but without content in the bundle: counted, not fatal.
    classified
        .missing
        .insert("/etc/lost.conf".to_string(), meta(WriteMode::Atomic, 0));
    classified
        .missing
        .insert("/etc/ok.conf".to_string(), meta(WriteMode::Atomic, 1_600_000_000));

    let mut reply = IntegrityReply {
        classified,
        ..Default::default()
    };
    reply.files.insert("/etc/ok.conf".to_string(), b"fine".to_vec());

    let counters = apply_integrity_reply(root, &manifest, &reply, NodeType::Worker, None);
    assert_eq!(counters.updated, 1);
    assert_eq!(counters.errors.get("missing"), Some(&1));
    assert_eq!(std::fs::read(root.join("etc/ok.conf")).unwrap(), b"fine");
}
