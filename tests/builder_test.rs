use std::time::Duration;

use okra::config::SchedulerSettings;
use okra::store::MemoryDb;
use okra::{Error, Item, ReschedulePolicy, SchedulerBuilder, Status};

#[tokio::test]
async fn build_requires_backend() {
    let result = SchedulerBuilder::<MemoryDb>::new()
        .database("db_name")
        .collection("scheduler_collection")
        .build()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[tokio::test]
async fn build_requires_collection() {
    let result = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .database("db_name")
        .build()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[tokio::test]
async fn build_rejects_unsafe_collection_name() {
    let result = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .collection("items\"; DROP TABLE x; --")
        .build()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[tokio::test]
async fn build_rejects_zero_lease() {
    let result = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .collection("jobs")
        .lease_expiration(Duration::ZERO)
        .build()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[tokio::test]
async fn build_rejects_lease_past_earliest_timestamp() {
    let result = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .collection("jobs")
        .lease_expiration(Duration::from_secs(10_000_000 * 365 * 86_400))
        .build()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[tokio::test]
async fn build_creates_scheduler() {
    let okra = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .database("db_name")
        .collection("test_collection")
        .lease_expiration(Duration::from_secs(5 * 60))
        .build()
        .await
        .unwrap();

    assert_eq!(okra.collection().database(), "db_name");
    assert_eq!(okra.collection().name(), "test_collection");
    assert_eq!(okra.lease_expiration(), chrono::Duration::minutes(5));
    assert_eq!(okra.reschedule_policy(), ReschedulePolicy::Update);
}

#[tokio::test]
async fn builder_applies_loaded_settings() {
    let settings = SchedulerSettings {
        database: "reports".into(),
        collection: "nightly".into(),
        lease_expiration_secs: 45,
        reschedule: ReschedulePolicy::Disabled,
    };
    let okra = SchedulerBuilder::new()
        .backend(MemoryDb::new())
        .settings(&settings)
        .build()
        .await
        .unwrap();

    assert_eq!(okra.collection().to_string(), "reports.nightly");
    assert_eq!(okra.lease_expiration(), chrono::Duration::seconds(45));
    assert_eq!(okra.reschedule_policy(), ReschedulePolicy::Disabled);
}

#[tokio::test]
async fn collections_are_isolated() {
    let db = MemoryDb::new();
    let emails = SchedulerBuilder::new()
        .backend(db.clone())
        .collection("emails")
        .build()
        .await
        .unwrap();
    let reports = SchedulerBuilder::new()
        .backend(db.clone())
        .collection("reports")
        .build()
        .await
        .unwrap();

    let mut item = Item::due_now();
    emails.schedule(&mut item).await.unwrap();

    assert_eq!(emails.count_by_status(Status::Pending).await.unwrap(), 1);
    assert_eq!(reports.count_by_status(Status::Pending).await.unwrap(), 0);
    assert!(reports.peek().await.unwrap().is_none());
}
