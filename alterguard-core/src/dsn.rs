//! Connection-string parsing.
//!
//! `DATABASE_DSN` uses the Go driver shape
//! `user[:password]@tcp(host:port)/database[?params]`. The parsed
//! [`ConnectionInfo`] feeds both the MySQL connection and the Percona
//! tool specifiers, which must never carry the password.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Distinct ways a connection string can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DsnError {
    /// No `@` separating credentials from the address.
    #[error("missing '@' separator; expected user[:password]@tcp(host:port)/database")]
    MissingSeparator,

    /// An `@` is present but the address is not `tcp(...)`.
    #[error("only TCP connections are supported; expected '@tcp(' after the credentials")]
    UnsupportedProtocol,

    /// The `user[:password]` segment is empty or has no user.
    #[error("invalid user[:password] segment")]
    InvalidCredentials,

    /// The address is not closed with `)/`.
    #[error("missing ')/' after host:port")]
    MissingAddressTerminator,

    /// The address is not `host:port`.
    #[error("invalid host:port '{0}'")]
    InvalidHostPort(String),

    /// The port is not a number in 0..=65535.
    #[error("invalid port number '{0}'")]
    InvalidPort(String),

    /// Nothing after `)/` (query parameters do not count).
    #[error("missing database name")]
    MissingDatabase,
}

/// Parsed form of a connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server hostname or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Default database (schema).
    pub database: String,
    /// Login user.
    pub user: String,
    /// Login password, if the string carried one.
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ConnectionInfo {
    /// Parse a `user[:password]@tcp(host:port)/database[?params]` string.
    ///
    /// Returns the first error encountered; no partially filled value is
    /// ever produced.
    pub fn parse(dsn: &str) -> Result<Self, DsnError> {
        let dsn = dsn.trim();
        let (credentials, address) = match dsn.rsplit_once("@tcp(") {
            Some(parts) => parts,
            None if dsn.contains('@') => return Err(DsnError::UnsupportedProtocol),
            None => return Err(DsnError::MissingSeparator),
        };

        let (user, password) = match credentials.split_once(':') {
            Some((user, password)) => (user, Some(password)),
            None => (credentials, None),
        };
        if user.is_empty() {
            return Err(DsnError::InvalidCredentials);
        }

        let (host_port, rest) = address
            .split_once(")/")
            .ok_or(DsnError::MissingAddressTerminator)?;

        let (host, port) = host_port
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| DsnError::InvalidHostPort(host_port.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DsnError::InvalidPort(port.to_string()))?;

        let database = rest.split('?').next().unwrap_or_default();
        if database.is_empty() {
            return Err(DsnError::MissingDatabase);
        }

        Ok(Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }

    /// Percona-style DSN for `table`, without credentials other than the user.
    pub fn tool_dsn(&self, table: &str, with_user: bool) -> ToolDsn {
        ToolDsn {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            table: table.to_string(),
            user: with_user.then(|| self.user.clone()),
        }
    }
}

impl FromStr for ConnectionInfo {
    type Err = DsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A Percona Toolkit DSN (`h=host,P=port,D=db,t=table[,u=user]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDsn {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub user: Option<String>,
}

impl fmt::Display for ToolDsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "h={},P={},D={},t={}",
            self.host, self.port, self.database, self.table
        )?;
        if let Some(ref user) = self.user {
            write!(f, ",u={}", user)?;
        }
        Ok(())
    }
}

impl FromStr for ToolDsn {
    type Err = DsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host = None;
        let mut port = None;
        let mut database = None;
        let mut table = None;
        let mut user = None;

        for part in s.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| DsnError::InvalidHostPort(part.to_string()))?;
            match key {
                "h" => host = Some(value.to_string()),
                "P" => {
                    port = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| DsnError::InvalidPort(value.to_string()))?,
                    )
                }
                "D" => database = Some(value.to_string()),
                "t" => table = Some(value.to_string()),
                "u" => user = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            host: host.ok_or_else(|| DsnError::InvalidHostPort(s.to_string()))?,
            port: port.ok_or_else(|| DsnError::InvalidPort(String::new()))?,
            database: database.ok_or(DsnError::MissingDatabase)?,
            table: table.unwrap_or_default(),
            user,
        })
    }
}
