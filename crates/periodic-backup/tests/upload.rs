#![allow(missing_docs)]

use core::time::Duration;
use std::{
    fs,
    sync::{Arc, Mutex},
};

use periodic_backup::{
    ProgressReporter,
    config::{
        AzureSettings, Destination, DestinationKind, GlacierSettings, GoogleCloudSettings,
        LocalFolderCopySettings, S3Settings,
    },
    context::RunContext,
    naming,
    progress::UploadState,
    retention::RetentionPolicy,
    status::UploadStatus,
    upload::{
        LocalFolderConnector, LocalFolderSink, RemoteRetention, RemoteSink, UploadPipeline,
        UploadTarget, object_key,
    },
};
use shared::{CancellationToken, PathSegment};

use common::{MemoryConnector, MemorySink, t0};

mod common;

const FOLDER: &str = "2024-01-01-00-00-00.ravendb-Northwind-A-backup";
const FILE: &str = "2024-01-01-00-00-00.ravendb-full-backup";

fn s3() -> Destination {
    Destination::S3(S3Settings {
        bucket_name: "backups".to_string(),
        region_name: "eu-west-1".to_string(),
        remote_folder_name: "northwind".to_string(),
        ..S3Settings::default()
    })
}

fn azure() -> Destination {
    Destination::Azure(AzureSettings {
        account_name: "account".to_string(),
        storage_container: "container".to_string(),
        remote_folder_name: String::new(),
        ..AzureSettings::default()
    })
}

fn google_cloud() -> Destination {
    Destination::GoogleCloud(GoogleCloudSettings {
        bucket_name: "bucket".to_string(),
        remote_folder_name: String::new(),
        ..GoogleCloudSettings::default()
    })
}

fn context() -> RunContext {
    RunContext::new(common::DATABASE, "Upload", true)
}

#[test]
fn object_keys_skip_empty_parts() {
    assert_eq!(object_key(&["", "set", "file"]), "set/file");
    assert_eq!(object_key(&["/prefix/", "set", "file"]), "prefix/set/file");
}

#[test]
fn one_failing_destination_does_not_stop_the_others() {
    let _guard = shared::test::init_test_logger();

    let directory = tempfile::tempdir().unwrap();
    let artifact = directory.path().join(FILE);
    fs::write(&artifact, b"backup contents").unwrap();

    let connector = MemoryConnector::new(vec![
        MemorySink::new(DestinationKind::S3),
        MemorySink::new(DestinationKind::Azure),
        MemorySink::failing(DestinationKind::GoogleCloud),
    ]);
    let context = context();
    let pipeline = UploadPipeline::new(&connector, &context);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&updates);
    let progress = ProgressReporter::new(move |progress| {
        seen.lock().unwrap().push(progress.clone());
    });

    let summary = pipeline.upload(
        UploadTarget {
            artifact: &artifact,
            folder_name: FOLDER,
            file_name: FILE,
        },
        &[s3(), azure(), google_cloud()],
        None,
        &progress,
        &CancellationToken::new(),
    );

    assert!(!summary.cancelled);

    let s3_status = &summary.statuses[&DestinationKind::S3];
    assert!(s3_status.uploaded && !s3_status.skipped && s3_status.error.is_none());
    assert!(summary.statuses[&DestinationKind::Azure].uploaded);

    let google = &summary.statuses[&DestinationKind::GoogleCloud];
    assert!(!google.uploaded);
    assert!(google.error.as_deref().unwrap().contains("503"));

    for kind in [
        DestinationKind::LocalFolder,
        DestinationKind::Glacier,
        DestinationKind::Ftp,
    ] {
        assert_eq!(summary.statuses[&kind], UploadStatus::skipped());
    }

    let error = summary.error().unwrap();
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.failures[0].0, DestinationKind::GoogleCloud);
    let message = error.to_string();
    assert!(message.starts_with("Failed to upload to 1 destinations:\nGoogle Cloud: "));
    assert!(message.contains("503"));

    assert_eq!(
        connector.sink(DestinationKind::S3).keys(),
        vec![format!("northwind/{FOLDER}/{FILE}")]
    );
    assert_eq!(
        connector.sink(DestinationKind::Azure).keys(),
        vec![format!("{FOLDER}/{FILE}")]
    );
    assert!(connector.sink(DestinationKind::GoogleCloud).keys().is_empty());

    let last = progress.snapshot();
    assert_eq!(last.uploads[&DestinationKind::S3], UploadState::Uploaded);
    assert!(matches!(
        last.uploads[&DestinationKind::GoogleCloud],
        UploadState::Failed(_)
    ));
    assert!(!updates.lock().unwrap().is_empty());
}

#[test]
fn cancelled_uploads_are_not_failures() {
    let directory = tempfile::tempdir().unwrap();
    let artifact = directory.path().join(FILE);
    fs::write(&artifact, b"backup contents").unwrap();

    let connector = MemoryConnector::new(vec![MemorySink::new(DestinationKind::S3)]);
    let context = context();
    let pipeline = UploadPipeline::new(&connector, &context);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = pipeline.upload(
        UploadTarget {
            artifact: &artifact,
            folder_name: FOLDER,
            file_name: FILE,
        },
        &[s3()],
        None,
        &ProgressReporter::silent(),
        &cancel,
    );

    assert!(summary.cancelled);
    assert!(summary.error().is_none());
    assert!(connector.sink(DestinationKind::S3).keys().is_empty());
}

#[test]
fn destinations_without_a_connector_fail() {
    let directory = tempfile::tempdir().unwrap();
    let artifact = directory.path().join(FILE);
    fs::write(&artifact, b"backup contents").unwrap();

    let context = context();
    let pipeline = UploadPipeline::new(&LocalFolderConnector, &context);

    let summary = pipeline.upload(
        UploadTarget {
            artifact: &artifact,
            folder_name: FOLDER,
            file_name: FILE,
        },
        &[s3()],
        None,
        &ProgressReporter::silent(),
        &CancellationToken::new(),
    );

    let error = summary.error().unwrap();
    assert_eq!(error.failures[0].0, DestinationKind::S3);
    assert!(error.to_string().contains("S3"));
}

#[test]
fn local_folder_copies_the_artifact() {
    let directory = tempfile::tempdir().unwrap();
    let artifact = directory.path().join(FILE);
    fs::write(&artifact, b"backup contents").unwrap();

    let target = directory.path().join("share");
    let destination = Destination::LocalFolder(LocalFolderCopySettings {
        folder_path: target.clone(),
        ..LocalFolderCopySettings::default()
    });

    let context = context();
    let pipeline = UploadPipeline::new(&LocalFolderConnector, &context);

    let summary = pipeline.upload(
        UploadTarget {
            artifact: &artifact,
            folder_name: FOLDER,
            file_name: FILE,
        },
        &[destination],
        None,
        &ProgressReporter::silent(),
        &CancellationToken::new(),
    );

    assert!(summary.error().is_none());
    assert!(summary.statuses[&DestinationKind::LocalFolder].uploaded);
    assert_eq!(
        fs::read(target.join(FOLDER).join(FILE)).unwrap(),
        b"backup contents"
    );
    assert_eq!(common::files_below(&target), vec![format!("{FOLDER}/{FILE}")]);
}

#[test]
fn local_folder_sink_lists_and_deletes() {
    let directory = tempfile::tempdir().unwrap();
    let source = directory.path().join("artifact");
    fs::write(&source, b"contents").unwrap();

    let sink = LocalFolderSink::new(directory.path().join("share"));
    let cancel = CancellationToken::new();

    sink.upload("set-a/one", &source, &cancel).unwrap();
    sink.upload("set-a/two", &source, &cancel).unwrap();
    sink.upload("set-b/one", &source, &cancel).unwrap();

    let mut folders = sink.list_folders("").unwrap();
    folders.sort();
    assert_eq!(folders, vec!["set-a", "set-b"]);

    let mut files = sink.list_objects("set-a").unwrap();
    files.sort();
    assert_eq!(files, vec!["one", "two"]);

    sink.delete_object("set-a/one").unwrap();
    sink.delete_object("set-a/one").unwrap();
    sink.delete_object("set-a/two").unwrap();
    sink.delete_folder("set-a").unwrap();

    assert_eq!(sink.list_folders("").unwrap(), vec!["set-b"]);
    assert!(sink.list_objects("missing").unwrap().is_empty());
}

#[test]
fn full_uploads_prune_listable_destinations() {
    let directory = tempfile::tempdir().unwrap();
    let now = t0() + chrono::TimeDelta::days(10);
    let stamp = naming::format_timestamp(now);
    let folder = format!("{stamp}.ravendb-Northwind-A-backup");
    let file = format!("{stamp}.ravendb-full-backup");

    let artifact = directory.path().join(&file);
    fs::write(&artifact, b"backup contents").unwrap();

    let expired = format!(
        "{}.ravendb-Northwind-A-backup",
        naming::format_timestamp(t0())
    );
    let expired_key = format!(
        "{expired}/{}.ravendb-full-backup",
        naming::format_timestamp(t0())
    );

    let s3_sink = MemorySink::new(DestinationKind::S3);
    s3_sink.insert(&format!("northwind/{expired_key}"), b"old");
    let glacier = MemorySink::new(DestinationKind::Glacier);
    glacier.insert(&expired_key, b"old");

    let connector = MemoryConnector::new(vec![s3_sink, glacier]);
    let context = context();
    let pipeline = UploadPipeline::new(&connector, &context);

    let policy = RetentionPolicy::new(Duration::from_secs(60 * 60 * 24));
    let database = PathSegment::try_from(common::DATABASE).unwrap();

    let glacier_destination = Destination::Glacier(GlacierSettings {
        vault_name: "vault".to_string(),
        region_name: "eu-west-1".to_string(),
        remote_folder_name: String::new(),
        ..GlacierSettings::default()
    });

    let summary = pipeline.upload(
        UploadTarget {
            artifact: &artifact,
            folder_name: &folder,
            file_name: &file,
        },
        &[s3(), glacier_destination],
        Some(RemoteRetention {
            policy: &policy,
            database: &database,
            now,
        }),
        &ProgressReporter::silent(),
        &CancellationToken::new(),
    );

    assert!(summary.error().is_none());

    assert_eq!(
        connector.sink(DestinationKind::S3).keys(),
        vec![format!("northwind/{folder}/{file}")]
    );

    // Glacier can't list, its old set stays.
    let mut glacier_keys = connector.sink(DestinationKind::Glacier).keys();
    glacier_keys.sort();
    assert_eq!(glacier_keys, vec![expired_key, format!("{folder}/{file}")]);
}
