//! Catalog files, component factory and the coordinator-backed store

mod common;

use common::{interval, segment, spawn_coordinator, StaticBroker, CATALOG};
use druid_warden::config::{ComponentFactory, SourceCatalog};
use druid_warden::inventory::RawInventory;
use druid_warden::segment::{CoordinatorSegmentStore, SegmentCatalog, SegmentMetadataStore};

use std::collections::HashMap;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn test_catalog_loads_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sources.json");
    std::fs::write(&path, CATALOG).unwrap();

    let catalog = SourceCatalog::load(&path).unwrap();
    assert_eq!(catalog.len(), 1);
    let source = catalog.get("web/page_views").unwrap();
    assert_eq!(source.data_source, "page_views");
    assert!(source.expected_metrics().contains("events"));
}

#[test]
fn test_missing_catalog_file_is_an_error() {
    let dir = tempdir().unwrap();
    assert!(SourceCatalog::load(dir.path().join("absent.json")).is_err());
}

#[tokio::test]
async fn test_local_raw_store_is_scanned() {
    let dir = tempdir().unwrap();
    let hour = dir.path().join("raw/page_views/hourly/2021/01/01/00");
    std::fs::create_dir_all(&hour).unwrap();
    std::fs::write(hour.join("page_views.0.1.120.gz"), b"x").unwrap();
    std::fs::write(hour.join("page_views.1.1.80.gz"), b"x").unwrap();

    let store = ComponentFactory::create_raw_store(dir.path().to_str().unwrap()).unwrap();
    assert!(store.uri().starts_with("file://"));

    let catalog = SourceCatalog::from_json_str(CATALOG).unwrap();
    let source = catalog.get("web/page_views").unwrap();
    let inventory = RawInventory::connect(vec![store], 2, &[source.clone()])
        .await
        .unwrap();
    let slots = inventory
        .slots(
            &source,
            &interval("2021-01-01T00:00:00Z/2021-01-01T02:00:00Z"),
        )
        .await
        .unwrap();

    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].events, 200);
}

#[tokio::test]
async fn test_coordinator_store_reads_used_segments() {
    let day = "2021-01-01T00:00:00Z/2021-01-02T00:00:00Z";
    let url = spawn_coordinator(HashMap::from([(
        "page_views".to_string(),
        vec![segment(day, "v1", "events,revenue", "country")],
    )]))
    .await;

    let store = Arc::new(CoordinatorSegmentStore::new(reqwest::Client::new(), url));
    assert!(store.used_segments("not_yet_created").await.unwrap().is_empty());

    let catalog = SegmentCatalog::new(store, Arc::new(StaticBroker::default()));
    let segments = catalog.load_all("page_views").await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].interval(), interval(day));
    assert!(segments[0].metrics().contains("revenue"));
}
