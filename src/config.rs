use std::path::PathBuf;

/// Server-wide configuration, assembled once in `main.rs` from parsed CLI
/// flags and handed around as an `Arc<ServerConfig>`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub control_path: PathBuf,
    pub password: Option<String>,
    pub static_path: Option<PathBuf>,
    pub debug: bool,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4020,
            control_path: default_control_path(),
            password: None,
            static_path: None,
            debug: false,
        }
    }
}

fn default_control_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".termrelay").join("control"))
        .unwrap_or_else(|| PathBuf::from(".termrelay/control"))
}
