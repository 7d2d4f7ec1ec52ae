//! Tests for the connection adapters

use super::*;
use async_trait::async_trait;
use conduit_core::{
    ConduitError, Connection, ConnectionUrl, DataFrame, DatabaseDriver, EngineOptions,
    QueryResult, ReadOptions, Result, SecretsSection, StatementResult, TomlSecrets, Transaction,
    Value,
};
use conduit_drivers::DriverRegistry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Counters shared by every mock handle created by one mock client
#[derive(Default)]
struct MockState {
    connects: AtomicU32,
    queries: AtomicU32,
    /// Remaining queries that fail; `u32::MAX` fails forever
    failures: AtomicU32,
    last_engine_options: Mutex<Option<EngineOptions>>,
    last_session_config: Mutex<Option<BTreeMap<String, String>>>,
}

impl MockState {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing(failures: u32) -> Arc<Self> {
        let state = Self::new();
        state.failures.store(failures, Ordering::SeqCst);
        state
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn queries(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    state: Arc<MockState>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<StatementResult> {
        Ok(StatementResult { affected_rows: 1 })
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<QueryResult> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        if self.state.should_fail() {
            return Err(ConduitError::Connection(
                "server closed the connection unexpectedly".into(),
            ));
        }
        Ok(QueryResult::from_rows(&["n"], vec![vec![Value::Int64(1)]]))
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        Err(ConduitError::NotSupported("mock transactions".into()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockDriver {
    state: Arc<MockState>,
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock"
    }

    async fn connect(&self, _url: &ConnectionUrl, options: &EngineOptions) -> Result<Arc<dyn Connection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        *self.state.last_engine_options.lock() = Some(options.clone());
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

fn mock_registry(state: &Arc<MockState>) -> Arc<DriverRegistry> {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(MockDriver {
        state: Arc::clone(state),
    }));
    Arc::new(registry)
}

const MOCK_SECRETS: &str = "[connections.sql]\nurl = \"mock://u@h/db\"\n";

async fn mock_sql(state: &Arc<MockState>) -> SqlConnection {
    SqlConnection::new(
        "sql",
        mock_registry(state),
        Arc::new(TomlSecrets::from_toml_str(MOCK_SECRETS)),
        ConnectOptions::new(),
    )
    .await
    .unwrap()
}

mod base_tests {
    use super::*;

    /// Hands out the connect call number as its handle
    struct CountingConnector {
        connects: Arc<AtomicU32>,
        seen_options: Arc<Mutex<Vec<ConnectOptions>>>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Handle = u32;

        const KIND: &'static str = "counting";
        const DEFAULT_CONNECTION_NAME: &'static str = "counting";

        async fn connect(&self, _secrets: &SecretsSection, options: &ConnectOptions) -> Result<u32> {
            self.seen_options.lock().push(options.clone());
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct NamelessConnector;

    #[async_trait]
    impl Connector for NamelessConnector {
        type Handle = ();

        const KIND: &'static str = "nameless";
        const DEFAULT_CONNECTION_NAME: &'static str = "";

        async fn connect(&self, _secrets: &SecretsSection, _options: &ConnectOptions) -> Result<()> {
            Ok(())
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        type Handle = ();

        const KIND: &'static str = "failing";
        const DEFAULT_CONNECTION_NAME: &'static str = "failing";

        async fn connect(&self, _secrets: &SecretsSection, _options: &ConnectOptions) -> Result<()> {
            Err(ConduitError::Connection("refused".into()))
        }
    }

    async fn counting(secrets: &str) -> (BaseConnection<CountingConnector>, Arc<AtomicU32>, Arc<Mutex<Vec<ConnectOptions>>>) {
        let connects = Arc::new(AtomicU32::new(0));
        let seen_options = Arc::new(Mutex::new(Vec::new()));
        let options = ConnectOptions::from([("pool_size".to_string(), serde_json::json!(2))]);
        let base = BaseConnection::new(
            "default",
            CountingConnector {
                connects: Arc::clone(&connects),
                seen_options: Arc::clone(&seen_options),
            },
            Arc::new(TomlSecrets::from_toml_str(secrets)),
            options,
        )
        .await
        .unwrap();
        (base, connects, seen_options)
    }

    #[tokio::test]
    async fn test_construction_connects_once() {
        let (base, connects, _) = counting("").await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(base.instance().await.unwrap(), 1);
        assert_eq!(base.instance().await.unwrap(), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_then_instance_reconnects_with_original_options() {
        let (base, connects, seen_options) = counting("").await;

        base.reset();
        assert!(!base.is_connected());
        assert_eq!(base.instance().await.unwrap(), 2);
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        let seen = seen_options.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[1].get("pool_size"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (base, connects, _) = counting("").await;
        base.reset();
        base.reset();
        assert_eq!(base.reset_count(), 2);
        base.instance().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_name_uses_connector_section() {
        let (base, _, _) = counting("[connections.counting]\nhost = \"h\"\n").await;
        assert_eq!(base.name(), "default");
        assert_eq!(base.section_name(), "counting");
        assert_eq!(base.get_secrets().get_str("host").as_deref(), Some("h"));
    }

    #[tokio::test]
    async fn test_secrets_are_empty_without_section() {
        let (base, _, _) = counting("[connections.other]\nhost = \"h\"\n").await;
        assert!(base.get_secrets().is_empty());
    }

    #[tokio::test]
    async fn test_failed_construction_is_an_error() {
        let result = BaseConnection::new(
            "failing",
            FailingConnector,
            Arc::new(TomlSecrets::empty()),
            ConnectOptions::new(),
        )
        .await;
        assert!(matches!(result, Err(ConduitError::Connection(_))));
    }

    #[tokio::test]
    async fn test_on_secrets_changed_resets_only_on_change() {
        let secrets = Arc::new(TomlSecrets::from_toml_str("[connections.counting]\nhost = \"a\"\n"));
        let connects = Arc::new(AtomicU32::new(0));
        let base = BaseConnection::new(
            "counting",
            CountingConnector {
                connects: Arc::clone(&connects),
                seen_options: Arc::new(Mutex::new(Vec::new())),
            },
            secrets.clone(),
            ConnectOptions::new(),
        )
        .await
        .unwrap();

        assert!(!base.on_secrets_changed());
        assert!(base.is_connected());

        assert!(secrets.replace("[connections.counting]\nhost = \"b\"\n"));
        assert!(base.on_secrets_changed());
        assert!(!base.is_connected());
        assert!(!base.on_secrets_changed());

        base.instance().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_describe_lists_configuration() {
        let (base, _, _) = counting("[connections.counting]\nhost = \"h\"\n").await;
        let summary = base.describe().await.unwrap();
        assert!(summary.contains("conduit connection `default` built from `counting`"));
        assert!(summary.contains("Configured from `[connections.counting]`"));
    }

    #[test]
    #[should_panic(expected = "does not declare a default connection name")]
    fn test_missing_default_connection_name_panics() {
        BaseConnection::<NamelessConnector>::default_connection_name();
    }
}

mod sql_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_identical_queries_within_ttl_execute_once() {
        let state = MockState::new();
        let conn = mock_sql(&state).await;
        let ttl = Some(Duration::from_secs(60));

        let first = conn.query("SELECT 1", ttl, &ReadOptions::default()).await.unwrap();
        let second = conn.query("SELECT 1", ttl, &ReadOptions::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(state.queries(), 1);
    }

    #[tokio::test]
    async fn test_different_arguments_are_cached_separately() {
        let state = MockState::new();
        let conn = mock_sql(&state).await;

        conn.query("SELECT 1", None, &ReadOptions::default()).await.unwrap();
        conn.query("SELECT 1", None, &ReadOptions::new().param(1i64)).await.unwrap();
        conn.query("SELECT 2", None, &ReadOptions::default()).await.unwrap();
        conn.query("SELECT 1", Some(Duration::from_secs(5)), &ReadOptions::default())
            .await
            .unwrap();

        assert_eq!(state.queries(), 4);
        assert_eq!(conn.cache().len(), 4);
    }

    #[tokio::test]
    async fn test_non_finite_float_params_are_cached_separately() {
        let state = MockState::new();
        let conn = mock_sql(&state).await;

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            conn.query("SELECT ?1", None, &ReadOptions::new().param(value))
                .await
                .unwrap();
        }

        assert_eq!(state.queries(), 3);
        assert_eq!(conn.cache().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_retries_three_times() {
        let state = MockState::failing(u32::MAX);
        let conn = mock_sql(&state).await;

        let err = conn
            .query("SELECT 1", None, &ReadOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Connection error: server closed the connection unexpectedly"
        );
        assert_eq!(state.queries(), 3);
        assert_eq!(conn.base().reset_count(), 3);
        // Construction plus reconnects before attempts two and three
        assert_eq!(state.connects(), 3);
        assert!(conn.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let state = MockState::failing(1);
        let conn = mock_sql(&state).await;

        let frame = conn.query("SELECT 1", None, &ReadOptions::default()).await.unwrap();
        assert_eq!(frame.get(0, "n"), Some(&Value::Int64(1)));
        assert_eq!(conn.base().reset_count(), 1);
        assert_eq!(state.connects(), 2);
    }

    #[tokio::test]
    async fn test_invalid_read_options_are_not_retried() {
        let state = MockState::new();
        let conn = mock_sql(&state).await;

        let options = ReadOptions::new().extra("dtype_backend", serde_json::json!("pyarrow"));
        let err = conn.query("SELECT 1", None, &options).await.unwrap_err();

        assert!(matches!(err, ConduitError::Configuration(_)));
        assert_eq!(state.queries(), 0);
        assert_eq!(conn.base().reset_count(), 0);
    }

    #[tokio::test]
    async fn test_autocommit_option_reaches_driver() {
        let state = MockState::new();
        let conn = SqlConnection::new(
            "sql",
            mock_registry(&state),
            Arc::new(TomlSecrets::from_toml_str(MOCK_SECRETS)),
            ConnectOptions::from([
                ("autocommit".to_string(), serde_json::json!(true)),
                ("echo".to_string(), serde_json::json!(true)),
            ]),
        )
        .await
        .unwrap();

        let options = state.last_engine_options.lock().clone().unwrap();
        assert!(options.is_autocommit());
        assert_eq!(options.get_bool("echo"), Some(true));
        assert!(conn.instance().await.unwrap().is_autocommit());
    }

    #[tokio::test]
    async fn test_missing_host_fails_construction() {
        let state = MockState::new();
        let result = SqlConnection::new(
            "sql",
            mock_registry(&state),
            Arc::new(TomlSecrets::from_toml_str(
                "[connections.sql]\ndialect = \"mock\"\nusername = \"u\"\n",
            )),
            ConnectOptions::new(),
        )
        .await;

        match result {
            Err(ConduitError::Configuration(message)) => assert!(message.contains("host")),
            Err(other) => panic!("expected configuration error, got {}", other),
            Ok(_) => panic!("expected configuration error"),
        }
        assert_eq!(state.connects(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_dialect_hints_at_package() {
        let result = SqlConnection::new(
            "sql",
            Arc::new(DriverRegistry::new()),
            Arc::new(TomlSecrets::from_toml_str(
                "[connections.sql]\ndialect = \"postgresql\"\nusername = \"u\"\nhost = \"h\"\n",
            )),
            ConnectOptions::new(),
        )
        .await;

        let err = result.err().unwrap();
        assert!(matches!(err, ConduitError::MissingDependency { .. }));
        assert!(err.to_string().contains("'tokio-postgres'"));
    }

    #[tokio::test]
    async fn test_describe_reports_dialect() {
        let state = MockState::new();
        let conn = mock_sql(&state).await;
        let summary = conn.describe().await.unwrap();
        assert!(summary.contains("built from `sql`"));
        assert!(summary.contains("Configured from `[connections.sql]`"));
        assert!(summary.contains("- Dialect: `mock`"));
    }

    fn sqlite_secrets(dir: &tempfile::TempDir) -> Arc<TomlSecrets> {
        let db = dir.path().join("app.db");
        Arc::new(TomlSecrets::from_toml_str(&format!(
            "[connections.sql]\nurl = \"sqlite:///{}\"\n",
            db.display()
        )))
    }

    async fn sqlite_connection(dir: &tempfile::TempDir, options: ConnectOptions) -> SqlConnection {
        SqlConnection::new(
            "default",
            Arc::new(DriverRegistry::with_defaults()),
            sqlite_secrets(dir),
            options,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_session_commit_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite_connection(&dir, ConnectOptions::new()).await;

        {
            let mut session = conn.session().await.unwrap();
            session.execute("CREATE TABLE numbers (val INTEGER)", &[]).await.unwrap();
            session
                .execute("INSERT INTO numbers (val) VALUES (?1)", &[Value::Int64(7)])
                .await
                .unwrap();
            assert!(session.in_transaction());
            session.commit().await.unwrap();
            assert!(!session.in_transaction());
        }

        {
            let mut session = conn.session().await.unwrap();
            session
                .execute("INSERT INTO numbers (val) VALUES (?1)", &[Value::Int64(8)])
                .await
                .unwrap();
        }

        let frame = conn
            .query("SELECT val FROM numbers", None, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(frame.row_count(), 1);
        assert_eq!(frame.get(0, "val"), Some(&Value::Int64(7)));
    }

    #[tokio::test]
    async fn test_sqlite_explicit_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite_connection(&dir, ConnectOptions::new()).await;

        let mut session = conn.session().await.unwrap();
        session.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        session.commit().await.unwrap();
        session.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        session.rollback().await.unwrap();
        let rows = session.query("SELECT COUNT(*) AS c FROM t", &[]).await.unwrap();
        assert_eq!(rows.rows[0].get_by_name("c"), Some(&Value::Int64(0)));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_overlapping_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite_connection(&dir, ConnectOptions::new()).await;
        {
            let mut setup = conn.session().await.unwrap();
            setup.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
            setup.commit().await.unwrap();
        }

        let mut a = conn.session().await.unwrap();
        let mut b = conn.session().await.unwrap();
        a.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();

        let seen_by_b = b.query("SELECT COUNT(*) AS n FROM t", &[]).await.unwrap();
        assert_eq!(seen_by_b.rows[0].get_by_name("n"), Some(&Value::Int64(0)));

        let count = "SELECT COUNT(*) AS n FROM t";
        let frame = conn.query(count, None, &ReadOptions::default()).await.unwrap();
        assert_eq!(frame.get(0, "n"), Some(&Value::Int64(0)));

        b.rollback().await.unwrap();
        a.rollback().await.unwrap();

        b.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        b.commit().await.unwrap();

        let cached = conn.query(count, None, &ReadOptions::default()).await.unwrap();
        assert_eq!(cached.get(0, "n"), Some(&Value::Int64(0)));
        let frame = conn
            .query("SELECT v FROM t", None, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(frame.row_count(), 1);
        assert_eq!(frame.get(0, "v"), Some(&Value::Int64(2)));
    }

    #[tokio::test]
    async fn test_sqlite_autocommit_session_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite_connection(
            &dir,
            ConnectOptions::from([("autocommit".to_string(), serde_json::json!(true))]),
        )
        .await;

        {
            let mut session = conn.session().await.unwrap();
            session.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
            session.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
            assert!(!session.in_transaction());
        }

        let frame = conn
            .query("SELECT v FROM t", None, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(frame.row_count(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_read_options() {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite_connection(&dir, ConnectOptions::new()).await;

        let mut session = conn.session().await.unwrap();
        session
            .execute("CREATE TABLE fruit (id INTEGER, name TEXT, price REAL)", &[])
            .await
            .unwrap();
        for (id, name) in [(1i64, "apple"), (2, "pear"), (3, "plum")] {
            session
                .execute(
                    "INSERT INTO fruit VALUES (?1, ?2, 1.5)",
                    &[Value::Int64(id), name.into()],
                )
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
        drop(session);

        let options = ReadOptions::new()
            .index_col("id")
            .chunksize(2)
            .param(1i64)
            .extra("columns", serde_json::json!(["name"]));
        let frame = conn
            .query("SELECT * FROM fruit WHERE id >= ?1 ORDER BY id", None, &options)
            .await
            .unwrap();

        assert_eq!(frame.column_names(), vec!["name"]);
        assert_eq!(frame.index_names(), &["id".to_string()]);
        let chunks = frame.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].get(0, "name"), Some(&Value::String("plum".into())));
    }
}

mod warehouse_tests {
    use super::*;

    struct MockSession {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl WarehouseSession for MockSession {
        async fn sql(&self, _query: &str) -> Result<DataFrame> {
            self.state.queries.fetch_add(1, Ordering::SeqCst);
            if self.state.should_fail() {
                return Err(ConduitError::Query("session expired".into()));
            }
            Ok(DataFrame::new(vec!["n".into()], vec![vec![Value::Int64(1)]]))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MockBuilder {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl SessionBuilder for MockBuilder {
        async fn create(&self, config: &BTreeMap<String, String>) -> Result<Arc<dyn WarehouseSession>> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            *self.state.last_session_config.lock() = Some(config.clone());
            Ok(Arc::new(MockSession {
                state: Arc::clone(&self.state),
            }))
        }
    }

    const WAREHOUSE_SECRETS: &str = "[connections.snowpark]\naccount = \"acme\"\nuser = \"jdoe\"\n";

    async fn mock_warehouse(state: &Arc<MockState>, dir: &tempfile::TempDir) -> WarehouseConnection {
        let connector = WarehouseConnector::new(Arc::new(MockBuilder {
            state: Arc::clone(state),
        }))
        .with_legacy_config(dir.path().join("config"));
        WarehouseConnection::new(
            "default",
            connector,
            Arc::new(TomlSecrets::from_toml_str(WAREHOUSE_SECRETS)),
            ConnectOptions::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_construction_uses_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::new();
        let _conn = mock_warehouse(&state, &dir).await;

        let config = state.last_session_config.lock().clone().unwrap();
        assert_eq!(config["account"], "acme");
        assert_eq!(config["user"], "jdoe");
        assert_eq!(state.connects(), 1);
    }

    #[tokio::test]
    async fn test_legacy_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config"),
            "[connections]\naccountname = \"legacy\"\nusername = old\ndbname = sales\n",
        )
        .unwrap();
        let state = MockState::new();
        let connector = WarehouseConnector::new(Arc::new(MockBuilder {
            state: Arc::clone(&state),
        }))
        .with_legacy_config(dir.path().join("config"));

        WarehouseConnection::new("snowpark", connector, Arc::new(TomlSecrets::empty()), ConnectOptions::new())
            .await
            .unwrap();

        let config = state.last_session_config.lock().clone().unwrap();
        assert_eq!(config["account"], "legacy");
        assert_eq!(config["database"], "sales");
    }

    #[tokio::test]
    async fn test_no_credentials_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::new();
        let connector = WarehouseConnector::new(Arc::new(MockBuilder {
            state: Arc::clone(&state),
        }))
        .with_legacy_config(dir.path().join("config"));

        let result =
            WarehouseConnection::new("snowpark", connector, Arc::new(TomlSecrets::empty()), ConnectOptions::new())
                .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("account"));
        assert_eq!(state.connects(), 0);
    }

    #[tokio::test]
    async fn test_query_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::new();
        let conn = mock_warehouse(&state, &dir).await;

        conn.query("SELECT 1", Some(Duration::from_secs(60))).await.unwrap();
        conn.query("SELECT 1", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(state.queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_retries_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::failing(u32::MAX);
        let conn = mock_warehouse(&state, &dir).await;

        let err = conn.query("SELECT 1", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Query error: session expired");
        assert_eq!(state.queries(), 3);
        assert_eq!(conn.base().reset_count(), 3);
        assert_eq!(state.connects(), 3);
    }

    #[tokio::test]
    async fn test_session_guard_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::new();
        let conn = mock_warehouse(&state, &dir).await;

        let guard = conn.session().await.unwrap();
        let frame = guard.sql("SELECT 1").await.unwrap();
        assert_eq!(frame.row_count(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), conn.session()).await;
        assert!(blocked.is_err());

        drop(guard);
        assert!(conn.session().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_query_reuses_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::failing(1);
        let conn = mock_warehouse(&state, &dir).await;

        let guard = conn.session().await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), guard.query("SELECT 1", None))
            .await
            .expect("query under the held lock must not wait for it")
            .unwrap();
        assert_eq!(frame.row_count(), 1);
        assert_eq!(conn.base().reset_count(), 1);
        assert_eq!(state.connects(), 2);
        drop(guard);

        conn.query("SELECT 1", None).await.unwrap();
        assert_eq!(state.queries(), 2);
        assert_eq!(conn.cache().stats().hits, 1);
    }

    struct SlowBuilder {
        inner: MockBuilder,
        delay: Duration,
    }

    #[async_trait]
    impl SessionBuilder for SlowBuilder {
        async fn create(&self, config: &BTreeMap<String, String>) -> Result<Arc<dyn WarehouseSession>> {
            tokio::time::sleep(self.delay).await;
            self.inner.create(config).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_creation_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = MockState::new();
        let connector = WarehouseConnector::new(Arc::new(SlowBuilder {
            inner: MockBuilder {
                state: Arc::clone(&state),
            },
            delay: Duration::from_secs(1),
        }))
        .with_legacy_config(dir.path().join("config"));
        let conn = Arc::new(
            WarehouseConnection::new(
                "default",
                connector,
                Arc::new(TomlSecrets::from_toml_str(WAREHOUSE_SECRETS)),
                ConnectOptions::new(),
            )
            .await
            .unwrap(),
        );
        assert_eq!(state.connects(), 1);

        conn.reset();
        let pending = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.query("SELECT 1", None).await }
        });
        tokio::task::yield_now().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), conn.session()).await;
        assert!(blocked.is_err());
        assert_eq!(state.queries(), 0);

        pending.await.unwrap().unwrap();
        assert_eq!(state.connects(), 2);
        assert!(conn.session().await.is_ok());
    }
}

mod factory_tests {
    use super::*;

    const FACTORY_SECRETS: &str = r#"
[connections.sql]
url = "mock://u@h/db"

[connections.analytics]
type = "sql"
url = "mock://u@h/analytics"

[connections.untyped]
url = "mock://u@h/untyped"

[connections.lake]
type = "warehouse"
account = "acme"
user = "jdoe"

[connections.ledger]
type = "sql"
url = "oracle://u@h/ledger"

[connections.weird]
type = "mongo"
"#;

    fn factory(state: &Arc<MockState>) -> (ConnectionFactory, Arc<TomlSecrets>) {
        let secrets = Arc::new(TomlSecrets::from_toml_str(FACTORY_SECRETS));
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MockDriver {
            state: Arc::clone(state),
        }));
        let factory = ConnectionFactory::new(secrets.clone())
            .with_drivers(registry)
            .with_retry_policy(RetryPolicy::new(3, Duration::ZERO));
        (factory, secrets)
    }

    #[tokio::test]
    async fn test_first_party_name_is_its_own_kind() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let conn = factory.connection("sql", None, ConnectOptions::new()).await.unwrap();
        assert_eq!(conn.kind(), ConnectionKind::Sql);
        assert_eq!(conn.name(), "sql");
    }

    #[tokio::test]
    async fn test_kind_inferred_from_secrets() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let conn = factory.connection("analytics", None, ConnectOptions::new()).await.unwrap();
        assert_eq!(conn.kind(), ConnectionKind::Sql);
    }

    #[tokio::test]
    async fn test_untyped_name_is_a_configuration_error() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let err = factory
            .connection("untyped", None, ConnectOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::Configuration(_)));
        assert!(err.to_string().contains("untyped"));
    }

    #[tokio::test]
    async fn test_unknown_kind_lists_supported_kinds() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let err = factory.connection("weird", None, ConnectOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("snowpark, sql"));

        let err = factory
            .connection("sql", Some("mongo"), ConnectOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid connection 'mongo'"));
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!("warehouse".parse::<ConnectionKind>().unwrap(), ConnectionKind::Warehouse);
        assert_eq!("SNOWPARK".parse::<ConnectionKind>().unwrap(), ConnectionKind::Warehouse);
        assert_eq!(ConnectionKind::Warehouse.to_string(), "snowpark");
    }

    #[tokio::test]
    async fn test_env_prefixed_name() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("CONDUIT_TEST_FACTORY_CONNECTION", "analytics") };
        let conn = factory
            .connection("env:CONDUIT_TEST_FACTORY_CONNECTION", None, ConnectOptions::new())
            .await
            .unwrap();
        assert_eq!(conn.name(), "analytics");

        let err = factory
            .connection("env:CONDUIT_TEST_FACTORY_UNSET", None, ConnectOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CONDUIT_TEST_FACTORY_UNSET"));
    }

    #[tokio::test]
    async fn test_memoized_per_kind_name_and_options() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let first = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        let second = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(state.connects(), 1);

        let autocommit = ConnectOptions::from([("autocommit".to_string(), serde_json::json!(true))]);
        let third = factory.sql("sql", autocommit).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(state.connects(), 2);
        assert_eq!(factory.len().await, 2);

        factory.clear().await;
        assert!(factory.is_empty().await);
        factory.sql("sql", ConnectOptions::new()).await.unwrap();
        assert_eq!(state.connects(), 3);
    }

    #[tokio::test]
    async fn test_max_entries_evicts_oldest() {
        let state = MockState::new();
        let (factory, _) = factory(&state);
        let factory = factory.with_memo_policy(MemoPolicy {
            ttl: None,
            max_entries: Some(1),
        });

        let first = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        factory.sql("analytics", ConnectOptions::new()).await.unwrap();
        assert_eq!(factory.len().await, 1);

        let again = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_memo_ttl_rebuilds_expired_instances() {
        let state = MockState::new();
        let (factory, _) = factory(&state);
        let factory = factory.with_memo_policy(MemoPolicy {
            ttl: Some(Duration::from_millis(10)),
            max_entries: None,
        });

        let first = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = factory.sql("sql", ConnectOptions::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_warehouse_without_builder_is_missing_dependency() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let err = factory.connection("lake", None, ConnectOptions::new()).await.unwrap_err();
        assert!(matches!(err, ConduitError::MissingDependency { .. }));
        assert!(
            err.to_string()
                .contains("You need to install the 'snowflake-api' package to use this connection.")
        );
    }

    #[tokio::test]
    async fn test_unknown_dialect_gets_generic_hint() {
        let state = MockState::new();
        let (factory, _) = factory(&state);

        let err = factory.connection("ledger", None, ConnectOptions::new()).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("You may be missing a dependency required to use this connection.")
        );
    }

    #[tokio::test]
    async fn test_secrets_change_resets_affected_connections() {
        let state = MockState::new();
        let (factory, secrets) = factory(&state);

        let sql = factory.connection("sql", None, ConnectOptions::new()).await.unwrap();
        let analytics = factory.connection("analytics", None, ConnectOptions::new()).await.unwrap();
        assert_eq!(factory.secrets_changed().await, 0);

        let updated = FACTORY_SECRETS.replace("mock://u@h/analytics", "mock://u@h/analytics_v2");
        assert!(secrets.replace(&updated));
        assert_eq!(factory.secrets_changed().await, 1);

        assert!(sql.as_sql().unwrap().base().is_connected());
        assert!(!analytics.as_sql().unwrap().base().is_connected());

        let frame = analytics.query("SELECT 1", None).await.unwrap();
        assert_eq!(frame.row_count(), 1);
    }
}
