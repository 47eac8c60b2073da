//! Optional copy of the metadata catalog into Postgres.

use std::time::Duration;

use anyhow::{Context, Result};
use argosync_core::CatalogRow;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

pub const PROFILES_TABLE: &str = "argo_profiles";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS argo_profiles (
    float_id TEXT PRIMARY KEY,
    dac TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    num_profiles INTEGER NOT NULL,
    num_rows BIGINT NOT NULL,
    date_start TIMESTAMPTZ,
    date_end TIMESTAMPTZ,
    lat_min DOUBLE PRECISION,
    lat_max DOUBLE PRECISION,
    lon_min DOUBLE PRECISION,
    lon_max DOUBLE PRECISION,
    temp_min DOUBLE PRECISION,
    temp_max DOUBLE PRECISION,
    sal_min DOUBLE PRECISION,
    sal_max DOUBLE PRECISION,
    depth_min DOUBLE PRECISION,
    depth_max DOUBLE PRECISION,
    bgc_vars TEXT NOT NULL,
    platform_type TEXT,
    project_name TEXT,
    summary TEXT NOT NULL
)
"#;

const INSERT_ROW: &str = r#"
INSERT INTO argo_profiles (
    float_id, dac, fingerprint, num_profiles, num_rows, date_start, date_end,
    lat_min, lat_max, lon_min, lon_max, temp_min, temp_max, sal_min, sal_max,
    depth_min, depth_max, bgc_vars, platform_type, project_name, summary
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21
)
"#;

/// Replace the contents of `argo_profiles` with `rows` in one transaction.
pub async fn publish_catalog(database_url: &str, rows: &[CatalogRow]) -> Result<usize> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")?;

    let mut tx = pool.begin().await.context("opening publish transaction")?;
    sqlx::query(CREATE_TABLE)
        .execute(&mut *tx)
        .await
        .context("creating argo_profiles")?;
    sqlx::query("DELETE FROM argo_profiles")
        .execute(&mut *tx)
        .await
        .context("clearing argo_profiles")?;

    for row in rows {
        sqlx::query(INSERT_ROW)
            .bind(&row.float_id)
            .bind(&row.dac)
            .bind(row.fingerprint.as_str())
            .bind(i32::try_from(row.num_profiles).unwrap_or(i32::MAX))
            .bind(i64::try_from(row.num_rows).unwrap_or(i64::MAX))
            .bind(row.date_start)
            .bind(row.date_end)
            .bind(row.lat_min)
            .bind(row.lat_max)
            .bind(row.lon_min)
            .bind(row.lon_max)
            .bind(row.temp_min)
            .bind(row.temp_max)
            .bind(row.sal_min)
            .bind(row.sal_max)
            .bind(row.depth_min)
            .bind(row.depth_max)
            .bind(row.bgc_vars.join(","))
            .bind(&row.platform_type)
            .bind(&row.project_name)
            .bind(&row.summary)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting float {}", row.float_id))?;
    }

    tx.commit().await.context("committing argo_profiles")?;
    pool.close().await;
    info!(table = PROFILES_TABLE, rows = rows.len(), "catalog published");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_reported_not_panicked() {
        let err = publish_catalog("not a database url", &[])
            .await
            .expect_err("bad url");
        assert!(format!("{err:#}").contains("connecting to postgres"));
    }

    #[test]
    fn insert_binds_every_catalog_column() {
        let placeholders = (1..=21).map(|i| format!("${i}")).collect::<Vec<_>>();
        for p in &placeholders {
            assert!(INSERT_ROW.contains(p.as_str()), "{p}");
        }
        assert!(!INSERT_ROW.contains("$22"));
    }
}
