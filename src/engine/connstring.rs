//! Connection String Handling
//!
//! Parses the URL (`postgresql://`, `mysql://`), DB2 keyword and SQLite
//! path forms into a `ConnectionConfig`, and masks passwords for logging.

use super::{EngineError, EngineKind};

/// Default per-connection prepared statement cache size
pub const DEFAULT_STATEMENT_CACHE_SIZE: usize = 1000;

/// Connection parameters handed to an engine connector
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Engine detected from the connection string
    pub engine: EngineKind,

    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,

    /// Original, unparsed connection string
    pub connection_string: String,

    /// Connect timeout (seconds)
    pub timeout_seconds: u32,

    /// Maximum prepared statements kept per connection
    pub prepared_statement_cache_size: usize,
}

impl ConnectionConfig {
    /// Parse a connection string
    pub fn parse(conn_str: &str) -> Result<Self, EngineError> {
        if conn_str.trim().is_empty() {
            return Err(EngineError::InvalidConnectionString(
                "connection string is empty".to_string(),
            ));
        }

        let engine = EngineKind::from_connection_string(conn_str);
        let mut config = Self {
            engine,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            connection_string: conn_str.to_string(),
            timeout_seconds: 10,
            prepared_statement_cache_size: DEFAULT_STATEMENT_CACHE_SIZE,
        };

        match engine {
            EngineKind::PostgreSql | EngineKind::MySql => config.parse_url()?,
            EngineKind::Db2 => config.parse_keywords(),
            EngineKind::Sqlite => {
                let path = conn_str
                    .strip_prefix("sqlite://")
                    .or_else(|| conn_str.strip_prefix("sqlite:"))
                    .unwrap_or(conn_str);
                config.database = Some(path.to_string());
            }
        }

        Ok(config)
    }

    /// Override the connect timeout
    pub fn with_timeout(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Override the statement cache size (0 keeps the default)
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.prepared_statement_cache_size = if size == 0 {
            DEFAULT_STATEMENT_CACHE_SIZE
        } else {
            size
        };
        self
    }

    /// Connection string with the password masked
    pub fn masked(&self) -> String {
        mask_connection_string(&self.connection_string)
    }

    // scheme://[user[:pass]@]host[:port][/database]
    fn parse_url(&mut self) -> Result<(), EngineError> {
        let rest = self
            .connection_string
            .split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();

        let (userinfo, location) = match rest.rsplit_once('@') {
            Some((userinfo, location)) => (Some(userinfo.to_string()), location.to_string()),
            None => (None, rest.clone()),
        };

        if let Some(userinfo) = userinfo.filter(|u| !u.is_empty()) {
            match userinfo.split_once(':') {
                Some((user, pass)) => {
                    self.username = Some(user.to_string());
                    self.password = Some(pass.to_string());
                }
                None => self.username = Some(userinfo),
            }
        }

        let (host_port, database) = match location.split_once('/') {
            Some((host_port, database)) => (host_port, Some(database)),
            None => (location.as_str(), None),
        };

        if let Some(database) = database {
            let database = database.split('?').next().unwrap_or_default();
            if !database.is_empty() {
                self.database = Some(database.to_string());
            }
        }

        if !host_port.is_empty() {
            match host_port.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        EngineError::InvalidConnectionString(format!("invalid port: {}", port))
                    })?;
                    self.host = Some(host.to_string());
                    self.port = Some(port);
                }
                None => {
                    self.host = Some(host_port.to_string());
                    self.port = self.engine.default_port();
                }
            }
        }

        Ok(())
    }

    // KEY=VALUE;KEY=VALUE;
    fn parse_keywords(&mut self) {
        for pair in self.connection_string.clone().split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_uppercase().as_str() {
                "DATABASE" => self.database = Some(value),
                "HOSTNAME" | "HOST" => self.host = Some(value),
                "PORT" => self.port = value.parse().ok(),
                "UID" => self.username = Some(value),
                "PWD" => self.password = Some(value),
                _ => {}
            }
        }

        if self.port.is_none() && self.host.is_some() {
            self.port = self.engine.default_port();
        }
    }
}

/// Mask the password in a connection string for logging.
///
/// Each password character is replaced by `*`, so the string keeps its
/// length and shape.
pub fn mask_connection_string(conn_str: &str) -> String {
    if let Some(start) = conn_str.find("PWD=") {
        let value_start = start + "PWD=".len();
        let value_end = conn_str[value_start..]
            .find(';')
            .map(|offset| value_start + offset)
            .unwrap_or(conn_str.len());
        return mask_range(conn_str, value_start, value_end);
    }

    for scheme in ["mysql://", "postgresql://", "postgres://"] {
        if !conn_str.starts_with(scheme) {
            continue;
        }

        let after = scheme.len();
        let Some(at) = conn_str[after..].find('@').map(|offset| after + offset) else {
            break;
        };
        if let Some(colon) = conn_str[after..at].find(':').map(|offset| after + offset) {
            return mask_range(conn_str, colon + 1, at);
        }
        break;
    }

    conn_str.to_string()
}

fn mask_range(s: &str, start: usize, end: usize) -> String {
    let hidden = s[start..end].chars().count();
    format!("{}{}{}", &s[..start], "*".repeat(hidden), &s[end..])
}
