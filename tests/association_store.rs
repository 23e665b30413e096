// tests/association_store.rs

use std::path::Path;
use std::sync::Arc;
use futures::future::join_all;
use wlagent::association::{AssociationError, ImageVmAssociations};

#[tokio::test]
async fn counts_survive_agent_restart() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("image_vm_associations.json");
    let image = Path::new("/var/lib/nova/instances/_base/img-1");

    {
        let store = ImageVmAssociations::new(&file);
        assert_eq!(store.create("img-1", image).await.unwrap(), 1);
        assert_eq!(store.create("img-1", image).await.unwrap(), 2);
    }

    // A fresh handle sees exactly what the previous process wrote
    let store = ImageVmAssociations::new(&file);
    assert_eq!(store.count("img-1").await.unwrap(), 2);
    assert_eq!(store.image_path("img-1").await.unwrap().as_deref(), Some(image));
}

#[tokio::test]
async fn shared_image_is_released_by_the_last_instance_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageVmAssociations::new(dir.path().join("associations.json"));
    let image = Path::new("/images/img-1");

    store.create("img-1", image).await.unwrap();
    store.create("img-1", image).await.unwrap();

    let first = store.delete("img-1").await.unwrap();
    assert!(!first.is_last);
    assert_eq!(store.count("img-1").await.unwrap(), 1);

    let second = store.delete("img-1").await.unwrap();
    assert!(second.is_last);
    assert_eq!(second.image_path, image);
    assert!(store.entries().await.unwrap().is_empty());

    assert!(matches!(store.delete("img-1").await, Err(AssociationError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_from_many_tasks_are_all_counted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ImageVmAssociations::new(dir.path().join("associations.json")));

    let creates = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.create("img-1", Path::new("/images/img-1")).await })
    });
    for joined in join_all(creates).await {
        joined.unwrap().unwrap();
    }

    assert_eq!(store.count("img-1").await.unwrap(), 16);
}

#[tokio::test]
async fn corrupt_store_is_reported_and_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("associations.json");
    std::fs::write(&file, b"{ not json").unwrap();

    let store = ImageVmAssociations::new(&file);
    assert!(matches!(
        store.create("img-1", Path::new("/images/img-1")).await,
        Err(AssociationError::Corrupt { .. })
    ));
    assert_eq!(std::fs::read(&file).unwrap(), b"{ not json");
}
