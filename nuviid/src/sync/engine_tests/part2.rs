#[tokio::test]
async fn executed_operations_enter_the_suppression_set() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    let path = rig.paths.client_abs("edited.txt");
    std::fs::write(&path, b"v2").unwrap();
    rig.engine
        .ingest(LocalEvent::Modified { path: path.clone() })
        .await;

    assert!(!rig.engine.is_suppressed("edited.txt"));
    settle().await;
    assert!(rig.engine.is_suppressed("edited.txt"));
    assert!(!rig.engine.is_suppressed("other.txt"));
}

#[tokio::test]
async fn rename_suppresses_both_old_and_new_paths() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    std::fs::write(rig.paths.server_abs("a.txt"), b"x").unwrap();
    std::fs::write(rig.paths.client_abs("b.txt"), b"x").unwrap();
    rig.engine
        .ingest(LocalEvent::Renamed {
            old: rig.paths.client_abs("a.txt"),
            new: rig.paths.client_abs("b.txt"),
        })
        .await;

    settle().await;
    assert!(rig.engine.is_suppressed("a.txt"));
    assert!(rig.engine.is_suppressed("b.txt"));
}

#[tokio::test]
async fn suppression_expires_after_the_ttl() {
    let dir = tempdir().unwrap();
    let mut params = fast_params();
    params.suppression_ttl = StdDuration::from_millis(80);
    let rig = make_rig(dir.path(), params);

    let path = rig.paths.client_abs("short.txt");
    std::fs::write(&path, b"x").unwrap();
    rig.engine
        .ingest(LocalEvent::Modified { path: path.clone() })
        .await;
    settle().await;

    tokio::time::sleep(StdDuration::from_millis(150)).await;
    assert!(!rig.engine.is_suppressed("short.txt"));
}

#[tokio::test]
async fn pending_map_holds_one_entry_per_key() {
    let dir = tempdir().unwrap();
    let mut params = fast_params();
    params.debounce = StdDuration::from_secs(30);
    let rig = make_rig(dir.path(), params);

    let path = rig.paths.client_abs("dup.txt");
    std::fs::write(&path, b"x").unwrap();
    for _ in 0..3 {
        rig.engine
            .ingest(LocalEvent::Created {
                path: path.clone(),
                placeholder_only: false,
            })
            .await;
    }
    // Case-insensitive keying: the same file under a different case folds
    // into the same slot.
    rig.engine
        .ingest(LocalEvent::Created {
            path: rig.paths.client_abs("DUP.TXT"),
            placeholder_only: false,
        })
        .await;

    assert_eq!(rig.engine.pending_len(), 1);
    rig.engine.dispose().await;
}

#[tokio::test]
async fn deleted_records_age_out_of_the_move_window() {
    let dir = tempdir().unwrap();
    let mut params = fast_params();
    params.move_window = StdDuration::from_millis(60);
    let rig = make_rig(dir.path(), params);

    std::fs::write(rig.paths.server_abs("stale.txt"), b"x").unwrap();
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: rig.paths.client_abs("stale.txt"),
        })
        .await;

    // Let the record age well past the window.
    tokio::time::sleep(StdDuration::from_millis(400)).await;

    let mut rx = rig.events.subscribe();
    std::fs::create_dir_all(rig.paths.client_abs("sub")).unwrap();
    std::fs::write(rig.paths.client_abs("sub/stale.txt"), b"fresh").unwrap();
    rig.engine
        .ingest(LocalEvent::Created {
            path: rig.paths.client_abs("sub/stale.txt"),
            placeholder_only: false,
        })
        .await;

    settle().await;

    // Too late to pair: this is a plain create, not a move.
    let activities = drain_activities(&mut rx);
    assert_eq!(
        activities,
        vec![(ActivityKind::Uploaded, "sub/stale.txt".to_string())]
    );
}

#[tokio::test]
async fn terminal_failure_emits_sync_failed_and_clears_the_op() {
    let dir = tempdir().unwrap();
    let mut params = fast_params();
    params.max_retries = 1;
    let rig = make_rig(dir.path(), params);
    let mut rx = rig.events.subscribe();

    // A modify whose client file vanished before execution: the whole-file
    // copy cannot succeed.
    rig.engine
        .ingest(LocalEvent::Modified {
            path: rig.paths.client_abs("ghost.txt"),
        })
        .await;

    settle().await;

    assert_eq!(drain_failures(&mut rx), vec!["ghost.txt".to_string()]);
    assert_eq!(rig.engine.pending_len(), 0);
}

#[tokio::test]
async fn status_reflects_pending_work_and_failures() {
    let dir = tempdir().unwrap();
    let mut params = fast_params();
    params.max_retries = 1;
    let rig = make_rig(dir.path(), params);

    assert_eq!(rig.engine.status(), EngineStatus::Idle);

    let path = rig.paths.client_abs("w.txt");
    std::fs::write(&path, b"x").unwrap();
    rig.engine
        .ingest(LocalEvent::Modified { path: path.clone() })
        .await;
    assert_eq!(rig.engine.status(), EngineStatus::Syncing);

    settle().await;
    assert_eq!(rig.engine.status(), EngineStatus::Idle);

    // A permanent failure flips the aggregate to degraded.
    rig.engine
        .ingest(LocalEvent::Modified {
            path: rig.paths.client_abs("ghost.txt"),
        })
        .await;
    settle().await;
    assert_eq!(rig.engine.status(), EngineStatus::Degraded);
}

#[tokio::test]
async fn dispose_cancels_pending_timers() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    let path = rig.paths.client_abs("never.txt");
    std::fs::write(&path, b"x").unwrap();
    rig.engine
        .ingest(LocalEvent::Created {
            path: path.clone(),
            placeholder_only: false,
        })
        .await;

    rig.engine.dispose().await;
    settle().await;

    // The cancelled timer never executed its operation.
    assert!(!rig.paths.server_abs("never.txt").exists());
    assert_eq!(rig.engine.pending_len(), 0);
}
