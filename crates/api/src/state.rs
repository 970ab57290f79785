//! Application state

use std::sync::Arc;

use glimpse_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let redis = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                match redis::aio::ConnectionManager::new(client).await {
                    Ok(manager) => {
                        tracing::info!("Redis usage cache connected");
                        Some(manager)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Redis unavailable, usage cache disabled");
                        None
                    }
                }
            }
            None => {
                tracing::info!("REDIS_URL not set, usage cache disabled");
                None
            }
        };

        let billing = Arc::new(BillingService::from_env(pool.clone(), redis)?);
        if billing.is_configured() {
            tracing::info!("Stripe billing configured");
        } else {
            tracing::warn!("Stripe billing not configured, billing endpoints will degrade");
        }

        Ok(Self {
            pool,
            config,
            billing,
        })
    }
}
