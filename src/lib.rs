#![warn(missing_docs)]

//! # ora-piecewise
//!
//! The core of an Oracle database driver: bind and define buffer management,
//! piecewise transfer of large values, chunked LOB streaming and session
//! recovery, on top of a pluggable native client.
//!
//! The native client sits behind the [`Engine`] trait. The driver never
//! talks to the wire itself; it tells the engine what to prepare, bind and
//! execute, and answers the engine's requests for data it has not supplied
//! yet. [`MemoryEngine`] is a scripted in-process engine for tests.
//!
//! ## Features
//!
//! - **Unbounded values** - PL/SQL OUT values and LONG columns grow as
//!   pieces arrive; LOBs stream in fixed-size chunks
//! - **Async/await** - Built on Tokio; LOB sources and sinks are
//!   `AsyncRead`/`AsyncWrite`
//! - **Array DML** - One prepare, one execute over every row of the lists
//! - **Recovery** - Dead sessions are reopened, fatal server errors close
//!   the session, every error carries a diagnostic with the SQL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ora_piecewise::{Binds, Config, Connection, MemoryEngine};
//!
//! #[tokio::main]
//! async fn main() -> ora_piecewise::Result<()> {
//!     let config = Config::new("ORCL", "scott", "tiger");
//!     let mut conn = Connection::open(MemoryEngine::new(), config).await?;
//!
//!     let rows = conn
//!         .select("select id, name from users where dept = :1", &Binds::positional(["10"]))
//!         .await?;
//!     for row in &rows {
//!         println!("{:?} {:?}", row.get_str(0), row.get_by_name("name"));
//!     }
//!
//!     conn.close().await
//! }
//! ```
//!
//! ## Bind Variables
//!
//! `:1`, `:2`, ... are positional and `:name` is named. Quoted text is never
//! scanned. Values come from exactly one [`Binds`] source; empty values bind
//! as NULL.
//!
//! ```rust,no_run
//! use ora_piecewise::{Binds, Connection, MemoryEngine};
//!
//! # async fn example(conn: &mut Connection<MemoryEngine>) -> ora_piecewise::Result<()> {
//! let rows = conn
//!     .dml(
//!         "update users set name = :name where id = :id",
//!         &Binds::set([("id", "7"), ("name", "alice")]),
//!     )
//!     .await?;
//! println!("Rows updated: {}", rows);
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! Every DML commits on its own until `begin transaction`:
//!
//! ```rust,no_run
//! use ora_piecewise::{Binds, Connection, MemoryEngine};
//!
//! # async fn example(conn: &mut Connection<MemoryEngine>) -> ora_piecewise::Result<()> {
//! conn.exec_builtin("begin transaction").await?;
//! conn.dml("update accounts set balance = balance - 50 where id = 1", &Binds::none()).await?;
//! conn.dml("update accounts set balance = balance + 50 where id = 2", &Binds::none()).await?;
//! conn.exec_builtin("end transaction").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## LOBs
//!
//! ```rust,no_run
//! use ora_piecewise::{Binds, Connection, LobKind, MemoryEngine};
//!
//! # async fn example(conn: &mut Connection<MemoryEngine>) -> ora_piecewise::Result<()> {
//! conn.lob_dml(
//!     "insert into docs (id, body) values (1, empty_clob()) returning body into :1",
//!     LobKind::Clob,
//!     &["a long document"],
//! )
//! .await?;
//!
//! let mut out = Vec::new();
//! conn.write_lob("select body from docs where id = 1", &Binds::none(), &mut out)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod binds;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod error;
pub mod lob;
pub mod piecewise;
pub mod recovery;
pub mod row;
pub mod statement;

// Re-export commonly used types
pub use batch::ArrayBinds;
pub use binds::{Binds, Variables};
pub use config::Config;
pub use connection::{Builtin, Connection, Mode, PlsqlResult};
pub use constants::OracleType;
pub use engine::{Engine, EngineError, MemoryEngine};
pub use error::{Error, Result};
pub use lob::{LobKind, LobSource, LobTransfer};
pub use row::{ResultSet, Row};
pub use statement::{scan_bind_variables, BindName, StatementType};
