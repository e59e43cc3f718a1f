//! Connection configuration
//!
//! Holds the datasource and credentials plus the tuning values the buffer
//! pool and LOB streamer read: character expansion, LOB chunk size and the
//! prefetch hints applied to queries.
//!
//! Supports the `user/password@datasource` connect string form.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default maximum length of SQL text written to the log
pub const DEFAULT_MAX_STRING_LOG_LENGTH: i64 = 1024;

/// Default LOB and LONG streaming chunk size
pub const DEFAULT_LOB_BUFFER_SIZE: usize = 16384;

/// Default character expansion factor
pub const DEFAULT_CHAR_EXPANSION: usize = 1;

/// Connection configuration for the driver core.
///
/// # Examples
///
/// ```rust
/// use ora_piecewise::Config;
///
/// let config = Config::new("ORCL", "scott", "tiger")
///     .with_lob_buffer_size(32 * 1024)
///     .with_prefetch_rows(100);
/// ```
///
/// ```rust
/// use ora_piecewise::Config;
///
/// let config: Config = "scott/tiger@ORCL".parse().unwrap();
/// assert_eq!(config.user, "scott");
/// ```
#[derive(Clone)]
pub struct Config {
    /// Datasource (TNS alias or connect descriptor)
    pub datasource: String,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    password: String,
    /// Emit debug-level statement and streaming logs
    pub debug: bool,
    /// Longest SQL text logged verbatim; -1 logs everything
    pub max_string_log_length: i64,
    /// Multiplier applied to fixed-width fetch slots for multi-byte charsets
    pub char_expansion: usize,
    /// Chunk size for LOB streaming and initial LONG fetch capacity
    pub lob_buffer_size: usize,
    /// Rows prefetched per round trip for queries (0 = engine default)
    pub prefetch_rows: u32,
    /// Memory bound for prefetching (0 = engine default)
    pub prefetch_memory: u32,
}

impl Config {
    /// Create a new configuration with default tuning values
    pub fn new(
        datasource: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            datasource: datasource.into(),
            user: user.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Enable or disable debug logging
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the longest SQL text written to logs (-1 for unlimited)
    pub fn with_max_string_log_length(mut self, len: i64) -> Self {
        self.max_string_log_length = len;
        self
    }

    /// Set the character expansion factor (minimum 1)
    pub fn with_char_expansion(mut self, factor: usize) -> Self {
        self.char_expansion = factor.max(1);
        self
    }

    /// Set the LOB streaming chunk size (minimum 1)
    pub fn with_lob_buffer_size(mut self, size: usize) -> Self {
        self.lob_buffer_size = size.max(1);
        self
    }

    /// Set the query prefetch row count
    pub fn with_prefetch_rows(mut self, rows: u32) -> Self {
        self.prefetch_rows = rows;
        self
    }

    /// Set the query prefetch memory bound
    pub fn with_prefetch_memory(mut self, bytes: u32) -> Self {
        self.prefetch_memory = bytes;
        self
    }

    /// Get the password (for the engine's open call)
    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    /// Set the password
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    /// Apply a driver parameter by its traditional name.
    ///
    /// Keys are matched case-insensitively: `Debug`, `MaxStringLogLength`,
    /// `CharExpansion`, `LobBufferSize`, `PrefetchRows`, `PrefetchMemory`.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key.to_ascii_lowercase().as_str() {
            "debug" => self.debug = parse_bool(key, value)?,
            "maxstringloglength" => {
                let len: i64 = parse_number(key, value)?;
                self.max_string_log_length = if len < 0 { -1 } else { len };
            }
            "charexpansion" => {
                self.char_expansion = parse_number::<usize>(key, value)?.max(1);
            }
            "lobbuffersize" => {
                self.lob_buffer_size = parse_number::<usize>(key, value)?.max(1);
            }
            "prefetchrows" => self.prefetch_rows = parse_number(key, value)?,
            "prefetchmemory" => self.prefetch_memory = parse_number(key, value)?,
            _ => return Err(Error::Config(format!("unknown parameter `{}'", key))),
        }
        Ok(())
    }

    /// Truncate SQL text for logging according to `max_string_log_length`
    pub fn loggable<'a>(&self, sql: &'a str) -> &'a str {
        crate::recovery::loggable_sql(Some(sql), self.max_string_log_length)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Config(format!(
            "invalid boolean `{}' for parameter `{}'",
            value, key
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Config(format!("invalid number `{}' for parameter `{}'", value, key))
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datasource: String::new(),
            user: String::new(),
            password: String::new(),
            debug: false,
            max_string_log_length: DEFAULT_MAX_STRING_LOG_LENGTH,
            char_expansion: DEFAULT_CHAR_EXPANSION,
            lob_buffer_size: DEFAULT_LOB_BUFFER_SIZE,
            prefetch_rows: 0,
            prefetch_memory: 0,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("datasource", &self.datasource)
            .field("user", &self.user)
            .field("password", &"********")
            .field("debug", &self.debug)
            .field("max_string_log_length", &self.max_string_log_length)
            .field("char_expansion", &self.char_expansion)
            .field("lob_buffer_size", &self.lob_buffer_size)
            .field("prefetch_rows", &self.prefetch_rows)
            .field("prefetch_memory", &self.prefetch_memory)
            .finish()
    }
}

/// Parse a `user/password@datasource` connect string
///
/// The password and datasource parts are optional: `user`, `user/password`
/// and `user@datasource` are all accepted.
impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty connect string".to_string()));
        }

        let (credentials, datasource) = match s.rsplit_once('@') {
            Some((credentials, datasource)) => (credentials, datasource),
            None => (s, ""),
        };
        let (user, password) = credentials.split_once('/').unwrap_or((credentials, ""));

        if user.is_empty() {
            return Err(Error::Config("missing user in connect string".to_string()));
        }

        Ok(Config::new(datasource, user, password))
    }
}
