use std::net::SocketAddr;

#[derive(Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|p| *p > 0)
            .unwrap_or(3001);
        let bind = SocketAddr::from(([0, 0, 0, 0], port));

        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set (postgres://...)");

        Self { bind, database_url }
    }
}
