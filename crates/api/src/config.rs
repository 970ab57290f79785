//! Server configuration

/// Configuration loaded from the environment at startup. Stripe and email
/// settings are read separately by the billing crate; only the values the
/// server itself needs live here.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Usage cache; the API runs without it, uncached.
    pub redis_url: Option<String>,
    pub bind_address: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        Ok(Self {
            database_url,
            redis_url,
            bind_address,
        })
    }
}
