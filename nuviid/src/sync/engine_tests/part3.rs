#[tokio::test]
async fn rename_with_no_server_source_falls_back_to_create() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());
    let mut rx = rig.events.subscribe();

    // The file never reached the server under its old name.
    let new = rig.paths.client_abs("fresh-renamed.txt");
    std::fs::write(&new, b"contents").unwrap();
    rig.engine
        .ingest(LocalEvent::Renamed {
            old: rig.paths.client_abs("fresh.txt"),
            new: new.clone(),
        })
        .await;

    settle().await;

    assert_eq!(
        std::fs::read(rig.paths.server_abs("fresh-renamed.txt")).unwrap(),
        b"contents"
    );
    assert!(!rig.paths.server_abs("fresh.txt").exists());
    let activities = drain_activities(&mut rx);
    assert_eq!(
        activities,
        vec![(ActivityKind::Renamed, "fresh-renamed.txt".to_string())]
    );
}

#[tokio::test]
async fn chained_renames_keep_the_first_origin() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    std::fs::write(rig.paths.server_abs("one.txt"), b"x").unwrap();
    std::fs::write(rig.paths.client_abs("three.txt"), b"x").unwrap();

    rig.engine
        .ingest(LocalEvent::Renamed {
            old: rig.paths.client_abs("one.txt"),
            new: rig.paths.client_abs("two.txt"),
        })
        .await;
    rig.engine
        .ingest(LocalEvent::Renamed {
            old: rig.paths.client_abs("two.txt"),
            new: rig.paths.client_abs("three.txt"),
        })
        .await;
    assert_eq!(rig.engine.pending_len(), 1);

    settle().await;

    // one.txt went straight to three.txt; two.txt never existed remotely.
    assert!(rig.paths.server_abs("three.txt").is_file());
    assert!(!rig.paths.server_abs("one.txt").exists());
    assert!(!rig.paths.server_abs("two.txt").exists());
}

#[tokio::test]
async fn rename_after_pending_modify_refreshes_content() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    // Old name synced with stale bytes.
    std::fs::write(rig.paths.server_abs("notes.txt"), b"stale").unwrap();
    let old = rig.paths.client_abs("notes.txt");
    let new = rig.paths.client_abs("notes-final.txt");
    std::fs::write(&old, b"updated").unwrap();

    rig.engine
        .ingest(LocalEvent::Modified { path: old.clone() })
        .await;
    std::fs::rename(&old, &new).unwrap();
    rig.engine
        .ingest(LocalEvent::Renamed {
            old: old.clone(),
            new: new.clone(),
        })
        .await;

    settle().await;

    // The move carried the edit along.
    assert_eq!(
        std::fs::read(rig.paths.server_abs("notes-final.txt")).unwrap(),
        b"updated"
    );
    assert!(!rig.paths.server_abs("notes.txt").exists());
}

#[tokio::test]
async fn delete_removes_server_entry_and_client_record() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    std::fs::write(rig.paths.server_abs("gone.txt"), b"x").unwrap();
    let client = rig.paths.client_abs("gone.txt");
    std::fs::write(&client, b"x").unwrap();
    rig.store.mark_in_sync(&client).await.unwrap();

    std::fs::remove_file(&client).unwrap();
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: client.clone(),
        })
        .await;

    settle().await;

    assert!(!rig.paths.server_abs("gone.txt").exists());
    assert!(rig.store.record(&client).unwrap().is_none());
}

#[tokio::test]
async fn directory_delete_is_recursive_on_the_server() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    std::fs::create_dir_all(rig.paths.server_abs("proj/sub")).unwrap();
    std::fs::write(rig.paths.server_abs("proj/sub/deep.txt"), b"x").unwrap();
    std::fs::create_dir_all(rig.paths.client_abs("proj")).unwrap();
    rig.store
        .mark_in_sync(&rig.paths.client_abs("proj"))
        .await
        .unwrap();

    std::fs::remove_dir_all(rig.paths.client_abs("proj")).unwrap();
    rig.engine
        .ingest(LocalEvent::Deleted {
            path: rig.paths.client_abs("proj"),
        })
        .await;

    settle().await;
    assert!(!rig.paths.server_abs("proj").exists());
}

#[tokio::test]
async fn uploads_mark_the_client_entry_in_sync() {
    let dir = tempdir().unwrap();
    let rig = make_rig(dir.path(), fast_params());

    let path = rig.paths.client_abs("synced.txt");
    std::fs::write(&path, b"bytes").unwrap();
    rig.engine
        .ingest(LocalEvent::Created {
            path: path.clone(),
            placeholder_only: false,
        })
        .await;

    settle().await;

    let record = rig.store.record(&path).unwrap().unwrap();
    assert!(record.state.is_placeholder);
    assert!(record.state.is_in_sync);
    assert_eq!(record.identity.to_relative().unwrap(), "synced.txt");
    assert_eq!(
        std::fs::read(rig.paths.server_abs("synced.txt")).unwrap(),
        b"bytes"
    );
}
