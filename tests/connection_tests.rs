//! Tests for the connection request surface
//!
//! These tests drive a connection over the scripted in-memory engine and
//! verify query, DML, array DML and PL/SQL requests, transaction control,
//! recovery after engine failures and resource release on every path.

use ora_piecewise::constants::Status;
use ora_piecewise::engine::{Call, Cell, ColumnDescribe, EngineError, MemoryEngine, Scripted};
use ora_piecewise::{
    ArrayBinds, Binds, Builtin, Config, Connection, Error, Mode, OracleType, Variables,
};

fn config() -> Config {
    Config::new("ORCL", "scott", "tiger")
}

async fn connect(engine: MemoryEngine) -> Connection<MemoryEngine> {
    Connection::open(engine, config()).await.unwrap()
}

fn users_engine() -> MemoryEngine {
    let mut engine = MemoryEngine::new();
    engine.script(
        "select id, name from users",
        Scripted::query(
            vec![
                ColumnDescribe::new("ID", OracleType::Number, 22),
                ColumnDescribe::new("NAME", OracleType::Varchar, 30),
            ],
            vec![
                vec![Cell::text("1"), Cell::text("alice")],
                vec![Cell::text("2"), Cell::Null],
            ],
        ),
    );
    engine
}

/// Every pool handed out has been given back
fn assert_released(conn: &Connection<MemoryEngine>) {
    let (allocated, released) = conn.pool_stats();
    assert_eq!(allocated, released);
    assert!(!conn.has_pool());
    assert_eq!(conn.engine().live_lobs(), 0);
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_select_rows_and_columns() {
        let mut conn = connect(users_engine()).await;
        let rows = conn.select("select id, name from users", &Binds::none()).await.unwrap();

        assert_eq!(rows.columns().to_vec(), vec!["id", "name"]);
        assert_eq!(rows.row_count(), 2);
        assert_eq!(rows.rows()[0].get_by_name("name"), Some("alice"));
        assert_eq!(rows.rows()[1].get_str(0), Some("2"));
        assert!(rows.rows()[1].is_null(1));
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_select_binds_values() {
        let mut engine = MemoryEngine::new();
        engine.script(
            "select name from users where id = :1 and dept = :2",
            Scripted::query(
                vec![ColumnDescribe::new("NAME", OracleType::Varchar, 30)],
                vec![vec![Cell::text("alice")]],
            ),
        );
        let mut conn = connect(engine).await;
        let rows = conn
            .select(
                "select name from users where id = :1 and dept = :2",
                &Binds::positional(["7", ""]),
            )
            .await
            .unwrap();

        assert_eq!(rows.row_count(), 1);
        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.rows[0], vec![Some("7".to_string()), None]);
    }

    #[tokio::test]
    async fn test_prefetch_applied_when_configured() {
        let config = config().with_prefetch_rows(50);
        let mut conn = Connection::open(users_engine(), config).await.unwrap();
        conn.select("select id, name from users", &Binds::none()).await.unwrap();
        assert_eq!(conn.engine().prefetch(), Some((50, 0)));

        let mut conn = connect(users_engine()).await;
        conn.select("select id, name from users", &Binds::none()).await.unwrap();
        assert_eq!(conn.engine().prefetch(), None);
    }

    #[tokio::test]
    async fn test_one_row_variants() {
        let mut engine = users_engine();
        engine.script(
            "select name from users where id = 1",
            Scripted::query(
                vec![ColumnDescribe::new("NAME", OracleType::Varchar, 30)],
                vec![vec![Cell::text("alice")]],
            ),
        );
        engine.script(
            "select name from users where id = 0",
            Scripted::query(vec![ColumnDescribe::new("NAME", OracleType::Varchar, 30)], vec![]),
        );
        let mut conn = connect(engine).await;

        let row = conn
            .one_row("select name from users where id = 1", &Binds::none())
            .await
            .unwrap();
        assert_eq!(row.get_str(0), Some("alice"));

        let err = conn
            .one_row("select name from users where id = 0", &Binds::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRows));

        let err = conn
            .one_row("select id, name from users", &Binds::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyRows));

        let none = conn
            .zero_or_one_row("select name from users where id = 0", &Binds::none())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_select_rejects_dml() {
        let mut conn = connect(MemoryEngine::new()).await;
        let err = conn.select("update t set x = 1", &Binds::none()).await.unwrap_err();
        assert!(matches!(err, Error::NotAQuery));
        assert_eq!(conn.engine().calls(Call::Execute), 0);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_statement_freed_by_next_request() {
        let mut conn = connect(users_engine()).await;
        conn.select("select id, name from users", &Binds::none()).await.unwrap();
        assert_eq!(conn.engine().live_statements(), 1);

        conn.select("select id, name from users", &Binds::none()).await.unwrap();
        assert_eq!(conn.engine().live_statements(), 1);

        conn.flush().await;
        assert_eq!(conn.engine().live_statements(), 0);
    }
}

mod dml_tests {
    use super::*;

    #[tokio::test]
    async fn test_dml_row_count_and_binds() {
        let mut engine = MemoryEngine::new();
        engine.script("delete from t where id = :id", Scripted::dml(3));
        let mut conn = connect(engine).await;

        let rows = conn
            .dml("delete from t where id = :id", &Binds::set([("id", "7")]))
            .await
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(conn.result_rows().await.unwrap(), 3);

        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.rows[0], vec![Some("7".to_string())]);
        assert!(record.commit_on_success);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_dml_rejects_query() {
        let mut conn = connect(users_engine()).await;
        let err = conn
            .dml("select id, name from users", &Binds::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotDml));
    }

    #[tokio::test]
    async fn test_request_error_makes_no_engine_call() {
        let mut conn = connect(MemoryEngine::new()).await;
        let before = conn.engine().total_calls();

        let err = conn
            .dml("update t set a = :1, b = :2", &Binds::positional(["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotEnoughArguments(2)));
        assert_eq!(conn.engine().total_calls(), before);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_array_dml_executes_every_row_once() {
        let mut conn = connect(MemoryEngine::new()).await;
        let arrays = ArrayBinds::positional(vec![vec!["1", "2", "3"], vec!["a", "", "c"]]);

        let rows = conn
            .array_dml("insert into t (id, name) values (:1, :2)", &arrays)
            .await
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(conn.engine().calls(Call::Prepare), 1);
        assert_eq!(conn.engine().calls(Call::Execute), 1);

        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.iters, 3);
        assert_eq!(
            record.rows,
            vec![
                vec![Some("1".to_string()), Some("a".to_string())],
                vec![Some("2".to_string()), None],
                vec![Some("3".to_string()), Some("c".to_string())],
            ]
        );
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_array_dml_named_lists() {
        let mut conn = connect(MemoryEngine::new()).await;
        let arrays = ArrayBinds::named(vec![("name", vec!["x", "y"]), ("id", vec!["1", "2"])]);

        let rows = conn
            .array_dml("update t set name = :name where id = :id", &arrays)
            .await
            .unwrap();
        assert_eq!(rows, 2);
        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.rows[1], vec![Some("y".to_string()), Some("2".to_string())]);
    }

    #[tokio::test]
    async fn test_array_dml_mismatch_rejected_before_engine() {
        let mut conn = connect(MemoryEngine::new()).await;
        let before = conn.engine().total_calls();
        let arrays = ArrayBinds::positional(vec![vec!["1", "2", "3"], vec!["a", "b"]]);

        let err = conn
            .array_dml("insert into t values (:1, :2)", &arrays)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArrayRowMismatch { expected: 3, actual: 2, .. }));
        assert_eq!(conn.engine().total_calls(), before);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_array_dml_empty_lists() {
        let mut conn = connect(MemoryEngine::new()).await;
        let arrays = ArrayBinds::positional(vec![Vec::<&str>::new()]);
        let rows = conn.array_dml("insert into t values (:1)", &arrays).await.unwrap();
        assert_eq!(rows, 0);
        assert_eq!(conn.engine().calls(Call::Execute), 0);
    }

    #[tokio::test]
    async fn test_array_dml_without_binds() {
        let mut conn = connect(MemoryEngine::new()).await;
        let arrays = ArrayBinds::positional(vec![vec!["1"]]);
        let err = conn.array_dml("delete from t", &arrays).await.unwrap_err();
        assert!(matches!(err, Error::NoArrayBinds));
    }
}

mod plsql_tests {
    use super::*;

    const RET_BLOCK: &str = "begin :ret := lookup(:id); end;";

    #[tokio::test]
    async fn test_exec_plsql_returns_first_bind() {
        let mut engine = MemoryEngine::new();
        engine.script("begin :1 := version(); end;", Scripted::plsql().with_output("1", Some("19.3")));
        let mut conn = connect(engine).await;

        let value = conn.exec_plsql("begin :1 := version(); end;").await.unwrap();
        assert_eq!(value.as_deref(), Some("19.3"));
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_exec_plsql_grows_for_large_output() {
        let big = "x".repeat(10_000);
        let mut engine = MemoryEngine::new();
        engine.script("begin :1 := big(); end;", Scripted::plsql().with_output("1", Some(&big)));
        let mut conn = connect(engine).await;

        let value = conn.exec_plsql("begin :1 := big(); end;").await.unwrap();
        assert_eq!(value.as_deref(), Some(big.as_str()));
        assert!(conn.engine().calls(Call::Respond) >= 3);
    }

    #[tokio::test]
    async fn test_exec_plsql_null_output() {
        let mut engine = MemoryEngine::new();
        engine.script("begin :1 := null; end;", Scripted::plsql().with_output("1", None));
        let mut conn = connect(engine).await;
        assert_eq!(conn.exec_plsql("begin :1 := null; end;").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exec_plsql_bind_updates_variables() {
        let mut engine = MemoryEngine::new();
        engine.script(RET_BLOCK, Scripted::plsql().with_output("ret", Some("found")));
        let mut conn = connect(engine).await;

        let mut vars = Variables::new();
        vars.insert("id".to_string(), "7".to_string());
        let mut binds = Binds::variables(vars);

        let value = conn.exec_plsql_bind(RET_BLOCK, "ret", &mut binds).await.unwrap();
        assert_eq!(value.as_deref(), Some("found"));
        assert_eq!(binds.as_variables().unwrap()["ret"], "found");

        let record = conn.engine().executions().last().unwrap();
        assert_eq!(record.rows[0], vec![None, Some("7".to_string())]);
    }

    #[tokio::test]
    async fn test_exec_plsql_bind_unknown_return_variable() {
        let mut conn = connect(MemoryEngine::new()).await;
        let before = conn.engine().total_calls();
        let mut binds = Binds::set([("ret", ""), ("id", "1")]);

        let err = conn
            .exec_plsql_bind(RET_BLOCK, "missing", &mut binds)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReturnVariableNotFound(ref n) if n == "missing"));
        assert_eq!(conn.engine().total_calls(), before);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_plsql_writes_back_variables() {
        let block = "begin :a := :a || 'x'; :b := 2; end;";
        let mut engine = MemoryEngine::new();
        engine.script(
            block,
            Scripted::plsql()
                .with_output("a", Some("1x"))
                .with_output("b", Some("2")),
        );
        let mut conn = connect(engine).await;

        let mut vars = Variables::new();
        vars.insert("a".to_string(), "1".to_string());
        vars.insert("b".to_string(), String::new());

        let result = conn.plsql(block, &mut vars, None).await.unwrap();
        assert_eq!(vars["a"], "1x");
        assert_eq!(vars["b"], "2");
        assert_eq!(result.outputs.len(), 2);
        assert!(result.cursor.is_none());
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_plsql_undefined_variable() {
        let mut conn = connect(MemoryEngine::new()).await;
        let mut vars = Variables::new();
        let err = conn
            .plsql("begin :x := 1; end;", &mut vars, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UndefinedVariable(ref n) if n == "x"));
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_plsql_ref_cursor() {
        let block = "begin open :rc for select * from emp where dept = :dept; end;";
        let mut engine = MemoryEngine::new();
        engine.script(
            block,
            Scripted::plsql().with_cursor(
                vec![ColumnDescribe::new("ENAME", OracleType::Varchar, 20)],
                vec![vec![Cell::text("KING")], vec![Cell::text("CLARK")]],
            ),
        );
        let mut conn = connect(engine).await;

        let mut vars = Variables::new();
        vars.insert("dept".to_string(), "10".to_string());
        let result = conn.plsql(block, &mut vars, Some("rc")).await.unwrap();

        let cursor = result.cursor.unwrap();
        assert_eq!(cursor.columns().to_vec(), vec!["ename"]);
        assert_eq!(cursor.rows()[1].get_str(0), Some("CLARK"));
        assert_eq!(conn.engine().calls(Call::AllocCursor), 1);
        // the cursor is now the current statement; the block is gone
        assert_eq!(conn.engine().live_statements(), 1);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_plsql_second_cursor_rejected() {
        let block = "begin open :rc for select 1 from dual; open :rc for select 2 from dual; end;";
        let mut conn = connect(MemoryEngine::new()).await;
        let mut vars = Variables::new();

        let err = conn.plsql(block, &mut vars, Some("rc")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCursor(ref n) if n == "rc"));
        assert_eq!(conn.engine().calls(Call::AllocCursor), 0);
        assert_eq!(conn.engine().calls(Call::Prepare), 0);
        assert_released(&conn);
    }
}

mod transaction_tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins() {
        let mut conn = connect(MemoryEngine::new()).await;

        let begin = conn.exec_builtin("Begin Transaction").await.unwrap();
        assert_eq!(begin, Some(Builtin::Begin));
        assert_eq!(conn.mode(), Mode::Transaction);

        conn.dml("insert into t values (1)", &Binds::none()).await.unwrap();
        assert!(!conn.engine().executions().last().unwrap().commit_on_success);

        assert_eq!(conn.exec_builtin("abort transaction").await.unwrap(), Some(Builtin::Abort));
        assert_eq!(conn.mode(), Mode::Autocommit);
        assert_eq!(conn.engine().rollbacks(), 1);

        conn.exec_builtin("begin transaction").await.unwrap();
        conn.exec_builtin("end transaction").await.unwrap();
        assert_eq!(conn.engine().commits(), 1);
    }

    #[tokio::test]
    async fn test_reopen_resets_mode() {
        let mut conn = connect(MemoryEngine::new()).await;
        conn.exec_builtin("begin transaction").await.unwrap();
        conn.reopen().await.unwrap();
        assert_eq!(conn.mode(), Mode::Autocommit);
        assert_eq!(conn.engine().opens(), 2);
    }
}

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_codes_reopen_once() {
        for code in [1041u32, 3113, 12571] {
            let mut engine = MemoryEngine::new();
            engine.fail_on(Call::Execute, EngineError::new(code, "lost contact"));
            let mut conn = connect(engine).await;

            let err = conn.dml("update t set x = 1", &Binds::none()).await.unwrap_err();
            assert!(err.is_engine_error());
            assert_eq!(err.code(), Some(code.to_string()));

            assert_eq!(conn.engine().closes(), 1, "code {}", code);
            assert_eq!(conn.engine().opens(), 2, "code {}", code);
            assert!(conn.is_connected());
            assert_released(&conn);

            conn.dml("update t set x = 1", &Binds::none()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fatal_server_error_closes() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Prepare, EngineError::new(1034, "ORACLE not available"));
        let mut conn = connect(engine).await;

        let err = conn.dml("update t set x = 1", &Binds::none()).await.unwrap_err();
        assert_eq!(err.code().as_deref(), Some("1034"));
        assert!(!conn.is_connected());
        assert_eq!(conn.engine().opens(), 1);

        let err = conn.dml("update t set x = 1", &Binds::none()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_ordinary_error_leaves_session() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Execute, EngineError::new(942, "table or view does not exist"));
        let mut conn = connect(engine).await;

        let err = conn.dml("delete from nope", &Binds::none()).await.unwrap_err();
        assert!(err.to_string().contains("ORA-00942"));
        assert_eq!(conn.engine().opens(), 1);
        assert_eq!(conn.engine().closes(), 0);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_success_with_info_is_not_an_error() {
        let info = || EngineError::status(Status::SuccessWithInfo, "ORA-24347 null in aggregate");

        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Execute, info());
        let mut conn = connect(engine).await;
        assert!(conn.dml("update t set x = 1", &Binds::none()).await.is_ok());
        assert!(conn.is_connected());
        assert_released(&conn);

        let mut engine = users_engine();
        engine.fail_on(Call::ColumnCount, info());
        let mut conn = connect(engine).await;
        let rows = conn.select("select id, name from users", &Binds::none()).await.unwrap();
        assert_eq!(rows.row_count(), 2);

        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Commit, info());
        let mut conn = connect(engine).await;
        conn.exec_builtin("begin transaction").await.unwrap();
        assert_eq!(conn.exec_builtin("end transaction").await.unwrap(), Some(Builtin::End));
        assert_eq!(conn.mode(), Mode::Autocommit);

        let mut engine = MemoryEngine::new();
        engine.script("begin :out := 1; end;", Scripted::plsql());
        engine.fail_on(Call::Execute, info());
        let mut conn = connect(engine).await;
        let mut vars = Variables::new();
        vars.insert("out".to_string(), "0".to_string());
        assert!(conn.plsql("begin :out := 1; end;", &mut vars, None).await.is_ok());
        assert_eq!(conn.engine().opens(), 1);
    }

    #[tokio::test]
    async fn test_long_overread_ignored_only_for_statements() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Execute, EngineError::new(1405, "fetched column value is NULL"));
        let mut conn = connect(engine).await;
        assert!(conn.dml("update t set x = 1", &Binds::none()).await.is_ok());

        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Execute, EngineError::new(1405, "fetched column value is NULL"));
        let mut conn = connect(engine).await;
        let mut vars = Variables::new();
        vars.insert("x".to_string(), "1".to_string());
        let err = conn.plsql("begin :x := 1; end;", &mut vars, None).await.unwrap_err();
        assert_eq!(err.code().as_deref(), Some("1405"));
    }

    #[tokio::test]
    async fn test_bind_failure_releases_pool() {
        let mut engine = MemoryEngine::new();
        engine.fail_on_nth(Call::Bind, 2, EngineError::new(1036, "illegal variable name/number"));
        let mut conn = connect(engine).await;

        let err = conn
            .dml("update t set a = :1 where b = :2", &Binds::positional(["x", "y"]))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("dml: error in `bind ()'"));
        assert_eq!(conn.engine().calls(Call::Execute), 0);
        assert_released(&conn);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Open, EngineError::new(1017, "invalid username/password"));
        let err = Connection::open(engine, config()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "open: error in `open ()': ORA-01017: invalid username/password\nSQL: [nil]"
        );
    }
}

mod diagnostic_tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_error_marks_offset() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(
            Call::Execute,
            EngineError::new(923, "FROM keyword not found where expected").with_parse_offset(9),
        );
        let mut conn = connect(engine).await;

        let err = conn.select("select 1 fro dual", &Binds::none()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("select: error in `execute ()': ORA-00923"), "{}", message);
        assert!(message.ends_with("SQL: select 1  !>>>!fro dual"), "{}", message);
    }

    #[tokio::test]
    async fn test_long_sql_not_logged() {
        let mut engine = MemoryEngine::new();
        engine.fail_on(Call::Execute, EngineError::new(942, "table or view does not exist"));
        let config = config().with_max_string_log_length(5);
        let mut conn = Connection::open(engine, config).await.unwrap();

        let err = conn.dml("delete from nope", &Binds::none()).await.unwrap_err();
        assert!(err.to_string().ends_with("SQL: [too long]"));
    }
}
