#![allow(missing_docs)]

use core::{sync::atomic::Ordering, time::Duration};
use std::{sync::Arc, thread, time::Instant};

use periodic_backup::{
    BackupStatus,
    cluster::{ClusterCommand, ClusterError, CommitIndexWatch},
    config::BackupKind,
    context::RunContext,
    persistence::{StatusError, StatusPersistence},
};
use shared::CancellationToken;

use common::{DATABASE, InMemoryCluster};

mod common;

fn status(task_id: u64) -> BackupStatus {
    let mut status = BackupStatus::running_from(None, task_id, BackupKind::Backup, true, "A");
    status.last_document_watermark = Some(10);
    status.last_cluster_watermark = Some(2);
    status.folder_name = Some("2024-01-01-00-00-00.ravendb-Northwind-A-backup".to_string());
    status
}

#[test]
fn persisted_status_is_committed() {
    let cluster = InMemoryCluster::new();
    let shutdown = CancellationToken::new();
    let persistence = StatusPersistence::new(&cluster, Duration::from_secs(1), &shutdown);

    let index = persistence.persist(DATABASE, &status(7)).unwrap();

    assert_eq!(index, 1);
    assert_eq!(cluster.commits.committed(), 1);
    assert_eq!(cluster.status(DATABASE, 7), Some(status(7)));

    let commands = cluster.commands();
    let [ClusterCommand::UpdateBackupStatus { database, .. }] = commands.as_slice() else {
        panic!("expected one status update");
    };
    assert_eq!(database, DATABASE);
}

#[test]
fn every_update_has_its_own_request_id() {
    let first = ClusterCommand::update_backup_status(DATABASE, status(1));
    let second = ClusterCommand::update_backup_status(DATABASE, status(1));

    assert_ne!(first.request_id(), second.request_id());
}

#[test]
fn commands_serialise_with_a_type_tag() {
    let command = ClusterCommand::update_backup_status(DATABASE, status(1));
    let json = serde_json::to_value(&command).unwrap();

    assert_eq!(json["type"], "UpdateBackupStatus");
    assert_eq!(json["database"], DATABASE);
    assert_eq!(json["status"]["last_document_watermark"], 10);
}

#[test]
fn waits_for_a_late_commit() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.manual_commit.store(true, Ordering::SeqCst);

    let committer = {
        let cluster = Arc::clone(&cluster);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cluster.commits.advance(1);
        })
    };

    let shutdown = CancellationToken::new();
    let persistence = StatusPersistence::new(cluster.as_ref(), Duration::from_secs(5), &shutdown);

    assert_eq!(persistence.persist(DATABASE, &status(1)).unwrap(), 1);
    committer.join().unwrap();
}

#[test]
fn commit_timeout_is_an_error() {
    let cluster = InMemoryCluster::new();
    cluster.manual_commit.store(true, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let persistence = StatusPersistence::new(&cluster, Duration::from_millis(20), &shutdown);

    let started = Instant::now();
    let error = persistence.persist(DATABASE, &status(1)).unwrap_err();

    assert!(matches!(
        error,
        StatusError::Cluster(ClusterError::CommitTimeout(1, _))
    ));
    assert!(started.elapsed() >= Duration::from_millis(20));

    let context = RunContext::new(DATABASE, "Nightly", true);
    assert_eq!(
        persistence.persist_best_effort(&context, DATABASE, &status(1)),
        None
    );
}

#[test]
fn shutdown_stops_persisting() {
    let cluster = InMemoryCluster::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let persistence = StatusPersistence::new(&cluster, Duration::from_secs(1), &shutdown);

    assert!(matches!(
        persistence.persist(DATABASE, &status(1)),
        Err(StatusError::Cancelled)
    ));
    assert!(cluster.commands().is_empty());
}

#[test]
fn unavailable_cluster_is_an_error() {
    let cluster = InMemoryCluster::new();
    cluster.fail_submit.store(true, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let persistence = StatusPersistence::new(&cluster, Duration::from_secs(1), &shutdown);

    assert!(matches!(
        persistence.persist(DATABASE, &status(1)),
        Err(StatusError::Cluster(ClusterError::Unavailable(_)))
    ));
}

#[test]
fn commit_index_never_moves_back() {
    let watch = CommitIndexWatch::new();

    watch.advance(5);
    watch.advance(3);

    assert_eq!(watch.committed(), 5);
    assert!(watch.wait_at_least(4, Duration::ZERO).is_ok());
    assert!(matches!(
        watch.wait_at_least(6, Duration::from_millis(1)),
        Err(ClusterError::CommitTimeout(6, _))
    ));
}

#[test]
fn status_tracks_attempts_and_full_backups() {
    let mut status = BackupStatus::default();
    assert!(!status.has_full_backup());
    assert_eq!(status.watermarks(), Default::default());

    status.record_attempt(false, common::t0());
    assert_eq!(status.last_incremental_backup_attempt, Some(common::t0()));
    assert_eq!(status.last_full_backup_attempt, None);

    status.last_full_backup = Some(common::t0());
    assert!(!status.has_full_backup());
    status.folder_name = Some("set".to_string());
    assert!(status.has_full_backup());
}
