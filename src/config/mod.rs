use std::env;

#[derive(Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

impl AppConfig {
    /// Environment-driven configuration. `DATABASE_URL` wins when set;
    /// otherwise the URL is assembled from the CONSENT_DB_* variables.
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig {
                username: env::var("CONSENT_DB_USERNAME").unwrap_or_else(|_| "consent".to_string()),
                password: env::var("CONSENT_DB_PASSWORD").unwrap_or_default(),
                server: env::var("CONSENT_DB_SERVER").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("CONSENT_DB_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                database: env::var("CONSENT_DB_DATABASE")
                    .unwrap_or_else(|_| "consent".to_string()),
            },
        }
    }

    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }
}
