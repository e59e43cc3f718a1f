//! Tests for LOB and LONG transfers
//!
//! These tests verify chunked LOB writes through returning binds, LOB reads
//! into files and caller sinks, LOB materialization in queries and
//! piecewise LONG fetching.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use ora_piecewise::constants::Piece;
use ora_piecewise::engine::{Call, Cell, ColumnDescribe, LobChunk, MemoryEngine, Scripted};
use ora_piecewise::{Binds, Config, Connection, Error, LobKind, LobSource, LobTransfer, Mode, OracleType};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CHUNK: usize = 8;
const INSERT: &str = "insert into docs (id, body) values (1, empty_clob()) returning body into :1";
const SELECT_BODY: &str = "select body from docs where id = 1";

async fn connect(engine: MemoryEngine) -> Connection<MemoryEngine> {
    let config = Config::new("ORCL", "scott", "tiger").with_lob_buffer_size(CHUNK);
    Connection::open(engine, config).await.unwrap()
}

fn body_query(cell: Cell) -> MemoryEngine {
    let mut engine = MemoryEngine::new();
    engine.script(
        SELECT_BODY,
        Scripted::query(vec![ColumnDescribe::new("BODY", OracleType::Clob, 4000)], vec![vec![cell]]),
    );
    engine
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Accepts `limit` bytes, then reports the reader went away
struct ClosingSink {
    accepted: usize,
    limit: usize,
    kind: io::ErrorKind,
}

impl AsyncWrite for ClosingSink {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.accepted >= self.limit {
            return Poll::Ready(Err(io::Error::from(self.kind)));
        }
        self.accepted += buf.len();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Yields `good` bytes, then fails
struct FailingReader {
    good: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.good == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device unplugged")));
        }
        let n = self.good.min(buf.remaining());
        buf.put_slice(&vec![b'x'; n]);
        self.good -= n;
        Poll::Ready(Ok(()))
    }
}

mod lob_write_tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for len in [0, CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK] {
            let value = content(len);
            let mut conn = connect(MemoryEngine::new()).await;
            let rows = conn.lob_dml(INSERT, LobKind::Clob, &[&value]).await.unwrap();
            assert_eq!(rows, 1);

            let stored = conn.engine().created_lobs()[0].map(<[u8]>::to_vec);
            if len == 0 {
                assert_eq!(stored, None, "zero length must be NULL");
                assert!(conn.engine().lob_writes().is_empty());
            } else {
                assert_eq!(stored.as_deref(), Some(value.as_slice()), "len {}", len);
            }

            let cell = match stored {
                Some(stored) => Cell::lob(stored),
                None => Cell::Null,
            };
            let mut reader = connect(body_query(cell)).await;
            let mut out = Vec::new();
            let transfer = reader.write_lob(SELECT_BODY, &Binds::none(), &mut out).await.unwrap();
            assert_eq!(out, value, "len {}", len);
            if len == 0 {
                assert_eq!(transfer, LobTransfer::Null);
            } else {
                assert_eq!(transfer, LobTransfer::Complete(len as u64));
            }
        }
    }

    #[tokio::test]
    async fn test_piece_sequence() {
        let mut conn = connect(MemoryEngine::new()).await;
        conn.lob_dml(INSERT, LobKind::Clob, &[content(CHUNK + 1)]).await.unwrap();

        assert_eq!(
            conn.engine().lob_writes(),
            &[
                LobChunk { offset: 1, amount: CHUNK, piece: Piece::First },
                LobChunk { offset: CHUNK as u64 + 1, amount: 1, piece: Piece::Last },
            ]
        );
    }

    #[tokio::test]
    async fn test_every_returned_row_written() {
        let mut engine = MemoryEngine::new();
        let sql = "update docs set body = empty_blob() returning body into :1";
        engine.script(sql, Scripted::ReturningLobs { rows: 2 });
        let mut conn = connect(engine).await;

        let rows = conn.lob_dml(sql, LobKind::Blob, &[b"payload"]).await.unwrap();
        assert_eq!(rows, 2);
        let created = conn.engine().created_lobs();
        assert_eq!(created, vec![Some(&b"payload"[..]), Some(&b"payload"[..])]);
        assert_eq!(conn.engine().live_lobs(), 0);
    }

    #[tokio::test]
    async fn test_commit_follows_mode() {
        let mut conn = connect(MemoryEngine::new()).await;
        conn.lob_dml(INSERT, LobKind::Clob, &["abc"]).await.unwrap();
        assert_eq!(conn.engine().commits(), 1);
        assert!(!conn.engine().executions()[0].commit_on_success);

        conn.exec_builtin("begin transaction").await.unwrap();
        conn.lob_dml(INSERT, LobKind::Clob, &["abc"]).await.unwrap();
        assert_eq!(conn.engine().commits(), 1);
        assert_eq!(conn.mode(), Mode::Transaction);
    }

    #[tokio::test]
    async fn test_file_source() {
        use std::io::Write;

        let value = content(3 * CHUNK + 5);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&value).unwrap();
        file.flush().unwrap();

        let mut conn = connect(MemoryEngine::new()).await;
        conn.lob_dml_file(INSERT, LobKind::Blob, &[file.path()]).await.unwrap();
        assert_eq!(conn.engine().created_lobs()[0], Some(value.as_slice()));
    }

    #[tokio::test]
    async fn test_missing_file_rejected_before_engine() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");

        let mut conn = connect(MemoryEngine::new()).await;
        let before = conn.engine().total_calls();
        let err = conn.lob_dml_file(INSERT, LobKind::Blob, &[&missing]).await.unwrap_err();
        assert!(matches!(err, Error::CannotAccessFile(_)));
        assert!(err.to_string().starts_with("could not access file"));
        assert_eq!(conn.engine().total_calls(), before);
    }

    #[tokio::test]
    async fn test_named_lob_binds() {
        let sql = "update docs set title = :title, body = empty_clob() where id = :id returning body into :body";
        let mut conn = connect(MemoryEngine::new()).await;
        let binds = Binds::set([("title", "notes"), ("id", "4"), ("body", "the body text")]);

        conn.lob_dml_bind(sql, LobKind::Clob, &["body"], &binds).await.unwrap();

        assert_eq!(conn.engine().created_lobs(), vec![Some(&b"the body text"[..])]);
        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.rows[0][0].as_deref(), Some("notes"));
        assert_eq!(record.rows[0][1].as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_named_lob_bind_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"from a file").unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let sql = "update docs set body = empty_blob() where id = :id returning body into :body";
        let mut conn = connect(MemoryEngine::new()).await;
        let binds = Binds::set([("id", "4"), ("body", path.as_str())]);

        conn.lob_dml_file_bind(sql, LobKind::Blob, &[":body"], &binds).await.unwrap();
        assert_eq!(conn.engine().created_lobs(), vec![Some(&b"from a file"[..])]);
    }

    #[tokio::test]
    async fn test_unmatched_lob_bind_name() {
        let sql = "update docs set body = empty_clob() returning body into :body";
        let mut conn = connect(MemoryEngine::new()).await;
        let binds = Binds::set([("body", "x")]);

        let err = conn.lob_dml_bind(sql, LobKind::Clob, &["nope"], &binds).await.unwrap_err();
        assert!(matches!(err, Error::LobCountMismatch { binds: 0, sources: 1 }));
        assert_eq!(conn.engine().calls(Call::Prepare), 0);
        assert!(!conn.has_pool());
    }

    #[tokio::test]
    async fn test_write_failure_in_transaction_rolls_back() {
        let mut conn = connect(MemoryEngine::new()).await;
        conn.exec_builtin("begin transaction").await.unwrap();
        let source = LobSource::stream(FailingReader { good: CHUNK }, 3 * CHUNK as u64);
        let err = conn.lob_dml_sources(INSERT, LobKind::Blob, vec![source]).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)), "{}", err);
        assert!(err.is_streaming_error());
        assert_eq!(conn.engine().lob_writes().len(), 1);
        assert_eq!(conn.engine().rollbacks(), 1);
        assert_eq!(conn.engine().live_lobs(), 0);
        assert!(!conn.has_pool());
    }

    #[tokio::test]
    async fn test_stream_source() {
        let mut conn = connect(MemoryEngine::new()).await;
        let source = LobSource::stream(FailingReader { good: 2 * CHUNK + 1 }, 2 * CHUNK as u64 + 1);
        let rows = conn.lob_dml_sources(INSERT, LobKind::Blob, vec![source]).await.unwrap();

        assert_eq!(rows, 1);
        assert_eq!(conn.engine().created_lobs()[0], Some(&[b'x'; 2 * CHUNK + 1][..]));
        assert_eq!(conn.engine().lob_writes().len(), 3);
    }
}

mod lob_read_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_file() {
        let value = content(2 * CHUNK + 3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.txt");

        let mut conn = connect(body_query(Cell::lob(value.clone()))).await;
        let transfer = conn.lob_get_file(SELECT_BODY, &Binds::none(), &path).await.unwrap();

        assert_eq!(transfer, LobTransfer::Complete(value.len() as u64));
        assert_eq!(std::fs::read(&path).unwrap(), value);
        assert_eq!(conn.engine().calls(Call::LobRead), 3);
        assert_eq!(conn.engine().live_lobs(), 0);
    }

    #[tokio::test]
    async fn test_empty_and_null_create_no_file() {
        for cell in [Cell::lob(Vec::new()), Cell::Null] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("body.txt");

            let mut conn = connect(body_query(cell)).await;
            let transfer = conn.lob_get_file(SELECT_BODY, &Binds::none(), &path).await.unwrap();
            assert_eq!(transfer, LobTransfer::Null);
            assert!(!path.exists());
            assert_eq!(conn.engine().calls(Call::LobRead), 0);
        }
    }

    #[tokio::test]
    async fn test_no_rows() {
        let mut engine = MemoryEngine::new();
        engine.script(
            SELECT_BODY,
            Scripted::query(vec![ColumnDescribe::new("BODY", OracleType::Clob, 4000)], vec![]),
        );
        let mut conn = connect(engine).await;
        let mut out = Vec::new();
        let err = conn.write_lob(SELECT_BODY, &Binds::none(), &mut out).await.unwrap_err();
        assert!(matches!(err, Error::NoRows));
        assert!(!conn.has_pool());
    }

    #[tokio::test]
    async fn test_consumer_disconnect_stops_quietly() {
        let mut conn = connect(body_query(Cell::lob(content(3 * CHUNK)))).await;
        let mut sink = ClosingSink {
            accepted: 0,
            limit: CHUNK,
            kind: io::ErrorKind::BrokenPipe,
        };

        let transfer = conn.write_lob(SELECT_BODY, &Binds::none(), &mut sink).await.unwrap();
        assert!(matches!(transfer, LobTransfer::Stopped(n) if n < 3 * CHUNK as u64));
        assert_eq!(conn.engine().opens(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_reopens_session() {
        let mut conn = connect(body_query(Cell::lob(content(3 * CHUNK)))).await;
        let mut sink = ClosingSink {
            accepted: 0,
            limit: CHUNK,
            kind: io::ErrorKind::Other,
        };

        let err = conn.write_lob(SELECT_BODY, &Binds::none(), &mut sink).await.unwrap_err();
        assert!(err.is_streaming_error());
        assert_eq!(conn.engine().closes(), 1);
        assert_eq!(conn.engine().opens(), 2);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_select_materializes_lobs() {
        let mut engine = MemoryEngine::new();
        engine.script(
            "select id, body from docs",
            Scripted::query(
                vec![
                    ColumnDescribe::new("ID", OracleType::Number, 22),
                    ColumnDescribe::new("BODY", OracleType::Clob, 4000),
                ],
                vec![
                    vec![Cell::text("1"), Cell::lob(content(3 * CHUNK + 2))],
                    vec![Cell::text("2"), Cell::Null],
                ],
            ),
        );
        let mut conn = connect(engine).await;

        let rows = conn.select("select id, body from docs", &Binds::none()).await.unwrap();
        let expected = String::from_utf8(content(3 * CHUNK + 2)).unwrap();
        assert_eq!(rows.rows()[0].get_by_name("body"), Some(expected.as_str()));
        assert!(rows.rows()[1].is_null(1));
        assert_eq!(conn.engine().live_lobs(), 0);
    }
}

mod long_tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_chunk_size_still_grows() {
        let value = "x".repeat(40);
        let mut engine = MemoryEngine::new();
        engine.script(
            "select notes from legacy",
            Scripted::query(
                vec![ColumnDescribe::new("NOTES", OracleType::Long, 0)],
                vec![vec![Cell::text(value.clone())]],
            ),
        );
        let mut config = Config::new("ORCL", "scott", "tiger");
        config.lob_buffer_size = 0;
        let mut conn = Connection::open(engine, config).await.unwrap();

        let rows = conn.select("select notes from legacy", &Binds::none()).await.unwrap();
        assert_eq!(rows.rows()[0].get_str(0), Some(value.as_str()));
    }

    #[tokio::test]
    async fn test_long_column_grows_without_limit() {
        let long = "L".repeat(25 * CHUNK);
        let short = "short";
        let mut engine = MemoryEngine::new();
        engine.script(
            "select notes from legacy",
            Scripted::query(
                vec![ColumnDescribe::new("NOTES", OracleType::Long, 0)],
                vec![vec![Cell::text(long.clone())], vec![Cell::text(short)], vec![Cell::Null]],
            ),
        );
        let mut conn = connect(engine).await;

        let rows = conn.select("select notes from legacy", &Binds::none()).await.unwrap();
        assert_eq!(rows.rows()[0].get_str(0), Some(long.as_str()));
        assert_eq!(rows.rows()[1].get_str(0), Some(short));
        assert!(rows.rows()[2].is_null(0));

        // 8 -> 16 -> 32 -> 64 -> 128 -> 256 bytes of capacity for the first row
        assert!(conn.engine().calls(Call::Respond) >= 5);
    }
}
