#[tokio::test]
async fn create_then_rename_coalesces_to_one_server_mkdir() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());
    let mut rx = rig.events.subscribe();

    // User creates "New Folder", then renames it to "Reports" well inside
    // the debounce window.
    let created = rig.paths.client_abs("New Folder");
    std::fs::create_dir_all(&created).unwrap();
    rig.engine
        .ingest(LocalEvent::Created {
            path: created.clone(),
            placeholder_only: false,
        })
        .await;

    let renamed = rig.paths.client_abs("Reports");
    std::fs::rename(&created, &renamed).unwrap();
    rig.engine
        .ingest(LocalEvent::Renamed {
            old: created,
            new: renamed,
        })
        .await;

    settle().await;

    assert!(rig.paths.server_abs("Reports").is_dir());
    assert!(!rig.paths.server_abs("New Folder").exists());
    let activities = drain_activities(&mut rx);
    assert_eq!(
        activities,
        vec![(ActivityKind::Uploaded, "Reports".to_string())]
    );
    assert_eq!(rig.engine.pending_len(), 0);
}

#[tokio::test]
async fn cross_directory_move_becomes_one_server_rename() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    // A synced file under a/.
    std::fs::create_dir_all(rig.paths.server_abs("a")).unwrap();
    std::fs::write(rig.paths.server_abs("a/file.txt"), b"payload").unwrap();
    std::fs::create_dir_all(rig.paths.client_abs("a")).unwrap();
    std::fs::write(rig.paths.client_abs("a/file.txt"), b"payload").unwrap();
    rig.store
        .mark_in_sync(&rig.paths.client_abs("a/file.txt"))
        .await
        .unwrap();

    let mut rx = rig.events.subscribe();

    // The shell moves it to b/: a delete followed by a create.
    std::fs::create_dir_all(rig.paths.client_abs("b")).unwrap();
    std::fs::rename(
        rig.paths.client_abs("a/file.txt"),
        rig.paths.client_abs("b/file.txt"),
    )
    .unwrap();
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: rig.paths.client_abs("a/file.txt"),
        })
        .await;
    rig.engine
        .ingest(LocalEvent::Created {
            path: rig.paths.client_abs("b/file.txt"),
            placeholder_only: false,
        })
        .await;

    settle().await;

    assert!(rig.paths.server_abs("b/file.txt").is_file());
    assert!(!rig.paths.server_abs("a/file.txt").exists());
    assert_eq!(
        std::fs::read(rig.paths.server_abs("b/file.txt")).unwrap(),
        b"payload"
    );

    // The placeholder's identity followed the move.
    let record = rig
        .store
        .record(&rig.paths.client_abs("b/file.txt"))
        .unwrap()
        .unwrap();
    assert_eq!(record.identity.to_relative().unwrap(), "b/file.txt");

    let activities = drain_activities(&mut rx);
    assert_eq!(
        activities,
        vec![(ActivityKind::Moved, "b/file.txt".to_string())]
    );
}

#[tokio::test]
async fn replace_file_gesture_becomes_overwriting_rename() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    for (name, content) in [("report.txt", "old"), ("report-v2.txt", "new")] {
        std::fs::write(rig.paths.server_abs(name), content).unwrap();
        std::fs::write(rig.paths.client_abs(name), content).unwrap();
        rig.store
            .mark_in_sync(&rig.paths.client_abs(name))
            .await
            .unwrap();
    }

    let mut rx = rig.events.subscribe();

    // Drag report-v2.txt onto report.txt, accepting the overwrite. The
    // shell deletes the destination, deletes the source, creates the
    // destination.
    std::fs::rename(
        rig.paths.client_abs("report-v2.txt"),
        rig.paths.client_abs("report.txt"),
    )
    .unwrap();
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: rig.paths.client_abs("report.txt"),
        })
        .await;
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: rig.paths.client_abs("report-v2.txt"),
        })
        .await;
    rig.engine
        .ingest(LocalEvent::Created {
            path: rig.paths.client_abs("report.txt"),
            placeholder_only: false,
        })
        .await;

    settle().await;

    assert_eq!(
        std::fs::read(rig.paths.server_abs("report.txt")).unwrap(),
        b"new"
    );
    assert!(!rig.paths.server_abs("report-v2.txt").exists());

    let activities = drain_activities(&mut rx);
    assert_eq!(
        activities,
        vec![(ActivityKind::Moved, "report.txt".to_string())]
    );
}

#[tokio::test]
async fn placeholder_only_create_is_dropped() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());
    let mut rx = rig.events.subscribe();

    // The applier materialized x.txt; the reflected local event carries the
    // placeholder-only flag and no recent delete matches it.
    rig.engine
        .ingest(LocalEvent::Created {
            path: rig.paths.client_abs("x.txt"),
            placeholder_only: true,
        })
        .await;

    settle().await;

    assert!(!rig.paths.server_abs("x.txt").exists());
    assert_eq!(rig.engine.pending_len(), 0);
    assert!(drain_activities(&mut rx).is_empty());
}

#[tokio::test]
async fn create_then_delete_nets_to_nothing() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    let path = rig.paths.client_abs("fleeting.txt");
    std::fs::write(&path, b"gone soon").unwrap();
    rig.engine
        .ingest(LocalEvent::Created {
            path: path.clone(),
            placeholder_only: false,
        })
        .await;
    std::fs::remove_file(&path).unwrap();
    rig.engine.ingest(LocalEvent::Deleted { path }).await;

    assert_eq!(rig.engine.pending_len(), 0);
    settle().await;
    assert!(!rig.paths.server_abs("fleeting.txt").exists());
}

#[tokio::test]
async fn repeated_modifies_debounce_into_one_upload() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());
    let mut rx = rig.events.subscribe();

    let path = rig.paths.client_abs("doc.docx");
    for content in ["draft 1", "draft 2", "final"] {
        std::fs::write(&path, content).unwrap();
        rig.engine
            .ingest(LocalEvent::Modified { path: path.clone() })
            .await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    settle().await;

    assert_eq!(
        std::fs::read(rig.paths.server_abs("doc.docx")).unwrap(),
        b"final"
    );
    let uploads = drain_activities(&mut rx)
        .into_iter()
        .filter(|(kind, _)| *kind == ActivityKind::Uploaded)
        .count();
    assert_eq!(uploads, 1);
}
