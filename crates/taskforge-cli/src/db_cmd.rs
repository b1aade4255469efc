//! `taskforge db init` / `db migrate`: create the database (if needed) and
//! apply migrations.

use taskforge_db::config::DbConfig;
use taskforge_db::pool;

pub async fn run_db_init(db_config: &DbConfig) -> anyhow::Result<()> {
    println!("Initializing taskforge database...");

    pool::ensure_database_exists(db_config).await?;
    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("taskforge db init complete.");
    Ok(())
}

pub async fn run_db_migrate(db_config: &DbConfig) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;
    println!("taskforge db migrate complete.");
    Ok(())
}
