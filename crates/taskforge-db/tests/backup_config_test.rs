//! Integration tests for the singleton `backup_config` row.

use chrono::{Duration as ChronoDuration, Utc};

use taskforge_db::models::BackupScheduleType;
use taskforge_db::queries::backup_config::{
    get_or_init_backup_config, record_backup_ran, set_next_backup_at, update_backup_config,
};
use taskforge_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn get_or_init_seeds_defaults_on_first_call() {
    let (pool, db_name) = create_test_db().await;

    let config = get_or_init_backup_config(&pool).await.unwrap();
    assert!(!config.schedule_enabled);
    assert_eq!(config.schedule_type, BackupScheduleType::Nightly);
    assert_eq!(config.retention_count, 7);
    assert!(!config.encryption_required);
    assert!(config.next_backup_at.is_none());

    // Second call should return the same row, not insert another.
    let again = get_or_init_backup_config(&pool).await.unwrap();
    assert_eq!(again.id, config.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_backup_config_overwrites_mutable_fields() {
    let (pool, db_name) = create_test_db().await;

    let updated = update_backup_config(
        &pool,
        true,
        BackupScheduleType::Custom,
        Some("0 30 4 * * *"),
        14,
        true,
        Some("s3kr3t"),
    )
    .await
    .unwrap();

    assert!(updated.schedule_enabled);
    assert_eq!(updated.schedule_type, BackupScheduleType::Custom);
    assert_eq!(updated.cron_expression.as_deref(), Some("0 30 4 * * *"));
    assert_eq!(updated.retention_count, 14);
    assert!(updated.encryption_required);
    assert_eq!(updated.encryption_password.as_deref(), Some("s3kr3t"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn set_next_backup_at_does_not_disturb_other_fields() {
    let (pool, db_name) = create_test_db().await;

    update_backup_config(&pool, true, BackupScheduleType::Weekly, None, 5, false, None)
        .await
        .unwrap();

    let next = Utc::now() + ChronoDuration::hours(3);
    set_next_backup_at(&pool, Some(next)).await.unwrap();

    let config = get_or_init_backup_config(&pool).await.unwrap();
    assert_eq!(
        config.next_backup_at.unwrap().timestamp(),
        next.timestamp()
    );
    assert_eq!(config.schedule_type, BackupScheduleType::Weekly);
    assert_eq!(config.retention_count, 5);

    set_next_backup_at(&pool, None).await.unwrap();
    let cleared = get_or_init_backup_config(&pool).await.unwrap();
    assert!(cleared.next_backup_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn record_backup_ran_advances_last_backup_at_only() {
    let (pool, db_name) = create_test_db().await;

    let next = Utc::now() + ChronoDuration::hours(6);
    set_next_backup_at(&pool, Some(next)).await.unwrap();

    let before = get_or_init_backup_config(&pool).await.unwrap();
    assert!(before.last_backup_at.is_none());

    record_backup_ran(&pool).await.unwrap();

    let after = get_or_init_backup_config(&pool).await.unwrap();
    assert!(after.last_backup_at.is_some());
    assert_eq!(after.next_backup_at.unwrap().timestamp(), next.timestamp());

    pool.close().await;
    drop_test_db(&db_name).await;
}
