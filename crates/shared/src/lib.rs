//! Shared infrastructure for the Glimpse Cloud services.
//!
//! Database pool construction, the migrations runner, and the small
//! formatting helpers that api/billing/worker all need.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the standard database connection pool.
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Create a pool suitable for running migrations (longer timeouts, single
/// connection so DDL statements don't interleave).
pub async fn create_migration_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run embedded migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Format a count the way the product UI shows allowances: `10000` becomes
/// `"10K"`, `2500000` becomes `"2.5M"`. Exact below one thousand.
pub fn compact_number(value: i64) -> String {
    const THOUSAND: i64 = 1_000;
    const MILLION: i64 = 1_000_000;
    const BILLION: i64 = 1_000_000_000;

    let (scaled, suffix) = if value >= BILLION {
        (value as f64 / BILLION as f64, "B")
    } else if value >= MILLION {
        (value as f64 / MILLION as f64, "M")
    } else if value >= THOUSAND {
        (value as f64 / THOUSAND as f64, "K")
    } else {
        return value.to_string();
    };

    // One decimal, trimmed when it is ".0"
    let formatted = format!("{:.1}", scaled);
    let formatted = formatted.trim_end_matches(".0");
    format!("{}{}", formatted, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_number_small_values_are_exact() {
        assert_eq!(compact_number(0), "0");
        assert_eq!(compact_number(999), "999");
    }

    #[test]
    fn test_compact_number_thousands_and_millions() {
        assert_eq!(compact_number(1_000), "1K");
        assert_eq!(compact_number(10_000), "10K");
        assert_eq!(compact_number(2_500), "2.5K");
        assert_eq!(compact_number(1_000_000), "1M");
        assert_eq!(compact_number(8_500_000), "8.5M");
        assert_eq!(compact_number(3_000_000_000), "3B");
    }
}
