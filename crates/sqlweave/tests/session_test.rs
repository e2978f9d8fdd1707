//! End-to-end session tests against the scripted driver

use std::sync::Arc;

use sqlweave::prelude::*;
use sqlweave_rdbc::stub::{result_set, Fixture, StubDataSource, StubScript};
use sqlweave_rdbc::Value;

fn obj(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn setup(mapper_xml: &str) -> (SessionFactory, Arc<StubScript>) {
    setup_with(mapper_xml, |_| {})
}

fn setup_with(
    mapper_xml: &str,
    customize: impl FnOnce(&mut Configuration),
) -> (SessionFactory, Arc<StubScript>) {
    let ds = Arc::new(StubDataSource::new());
    let script = ds.script().clone();
    let mut config = Configuration::with_environment(Environment::new(
        "test",
        TransactionFactory::Managed,
        ds,
    ));
    customize(&mut config);
    let mut compiler = MapperCompiler::new();
    compiler.compile(&mut config, mapper_xml).unwrap();
    compiler.finish(&mut config).unwrap();
    (SessionFactory::new(config), script)
}

// ==================== Simple select ====================

#[tokio::test]
async fn simple_select_binds_and_materializes() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="findById" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let user = session
        .select_one("U.findById", 7_i64)
        .await
        .unwrap()
        .unwrap();

    let executed = script.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].sql,
        "SELECT id, name FROM users WHERE id = ?"
    );
    assert_eq!(executed[0].params, vec![Value::from(7_i64)]);

    let map = user.as_object().unwrap();
    assert_eq!(map.get("id"), Some(&Value::from(7_i64)));
    assert_eq!(map.get("name"), Some(&Value::from("Ann")));
    session.close().await.unwrap();
}

#[tokio::test]
async fn empty_result_set_yields_none() {
    let (factory, _script) = setup(
        r#"<mapper namespace="U">
             <select id="findById" resultType="map">SELECT id FROM users WHERE id = #{id}</select>
           </mapper>"#,
    );
    let mut session = factory.open_session().unwrap();
    assert!(session
        .select_one("U.findById", 1_i64)
        .await
        .unwrap()
        .is_none());
    assert!(session
        .select_list("U.findById", 1_i64)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn too_many_rows_fail_select_one() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT id FROM users</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id"],
            vec![vec![Value::from(1_i64)], vec![Value::from(2_i64)]],
        ),
    );
    let mut session = factory.open_session().unwrap();
    let err = session.select_one("U.all", Value::Null).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResultMaterialization);
}

#[tokio::test]
async fn statement_not_found_leaves_session_usable() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="ok" resultType="map">SELECT 1 AS one</select>
           </mapper>"#,
    );
    script.expect_query("SELECT 1", result_set(&["one"], vec![vec![Value::from(1_i64)]]));

    let mut session = factory.open_session().unwrap();
    let err = session.select_one("U.ghost", Value::Null).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StatementNotFound);

    // The failed lookup did not poison the session.
    assert!(session.select_one("U.ok", Value::Null).await.unwrap().is_some());
}

// ==================== Dynamic SQL ====================

#[tokio::test]
async fn dynamic_where_drops_empty_clauses() {
    let (factory, script) = setup(
        r#"<mapper namespace="O">
             <select id="find" resultType="map">SELECT * FROM orders
               <where>
                 <if test="uid != null">AND user_id=#{uid}</if>
                 <if test="min != null">AND amount &gt;= #{min}</if>
               </where>
             </select>
           </mapper>"#,
    );

    let mut session = factory.open_session().unwrap();
    session
        .select_list(
            "O.find",
            obj(vec![("uid", Value::from(3_i64)), ("min", Value::Null)]),
        )
        .await
        .unwrap();
    session
        .select_list(
            "O.find",
            obj(vec![("uid", Value::Null), ("min", Value::Null)]),
        )
        .await
        .unwrap();

    let executed = script.executed();
    assert_eq!(executed[0].sql, "SELECT * FROM orders WHERE user_id=?");
    assert_eq!(executed[0].params, vec![Value::from(3_i64)]);
    assert_eq!(executed[1].sql, "SELECT * FROM orders");
    assert!(executed[1].params.is_empty());
}

#[tokio::test]
async fn foreach_expands_positional_markers() {
    let (factory, script) = setup(
        r#"<mapper namespace="T">
             <select id="byKeys" resultType="map">SELECT * FROM t WHERE k IN
               <foreach item="k" collection="list" open="(" close=")" separator=",">#{k}</foreach>
             </select>
           </mapper>"#,
    );

    let mut session = factory.open_session().unwrap();
    let parameter = pack_args(vec![(
        "keys".to_string(),
        Value::Array(vec![
            Value::from(1_i64),
            Value::from(2_i64),
            Value::from(3_i64),
        ]),
    )]);
    session.select_list("T.byKeys", parameter).await.unwrap();

    let executed = script.executed();
    assert_eq!(executed[0].sql, "SELECT * FROM t WHERE k IN (?,?,?)");
    assert_eq!(
        executed[0].params,
        vec![Value::from(1_i64), Value::from(2_i64), Value::from(3_i64)]
    );
}

// ==================== Local cache ====================

#[tokio::test]
async fn local_cache_serves_repeat_queries_until_update() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="findById" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
             <update id="touch">UPDATE users SET touched = 1 WHERE id = #{id}</update>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let first = session.select_one("U.findById", 7_i64).await.unwrap();
    let second = session.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(script.execution_count(), 1);

    // Any write through the session clears the local cache.
    session
        .update("U.touch", &mut Value::from(7_i64))
        .await
        .unwrap();
    session.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(script.execution_count(), 3);
}

#[tokio::test]
async fn distinct_parameters_miss_the_local_cache() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="findById" resultType="map">SELECT id FROM users WHERE id = #{id}</select>
           </mapper>"#,
    );
    let mut session = factory.open_session().unwrap();
    session.select_list("U.findById", 1_i64).await.unwrap();
    session.select_list("U.findById", 2_i64).await.unwrap();
    assert_eq!(script.execution_count(), 2);
}

// ==================== Row bounds ====================

#[tokio::test]
async fn row_bounds_skip_and_limit_client_side() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT n FROM seq</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM seq",
        result_set(
            &["n"],
            (1..=4).map(|n| vec![Value::from(n as i64)]).collect(),
        ),
    );

    let mut session = factory.open_session().unwrap();
    let rows = session
        .select_list_bounds("U.all", Value::Null, RowBounds::new(1, 2))
        .await
        .unwrap();
    let ns: Vec<_> = rows
        .iter()
        .map(|r| r.as_object().unwrap().get("n").cloned().unwrap())
        .collect();
    assert_eq!(ns, vec![Value::from(2_i64), Value::from(3_i64)]);
}

// ==================== select_map / cursor / handler ====================

#[tokio::test]
async fn select_map_keys_by_property() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT id, name FROM users</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![
                vec![Value::from(1_i64), Value::from("Ann")],
                vec![Value::from(2_i64), Value::from("Bob")],
            ],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let map = session.select_map("U.all", Value::Null, "id").await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(
        map.get("2").unwrap().as_object().unwrap().get("name"),
        Some(&Value::from("Bob"))
    );
}

#[tokio::test]
async fn cursor_streams_rows_lazily() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT id FROM users</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id"],
            vec![vec![Value::from(1_i64)], vec![Value::from(2_i64)]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let mut cursor = session
        .select_cursor("U.all", Value::Null, RowBounds::default())
        .await
        .unwrap();
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(
        first.as_object().unwrap().get("id"),
        Some(&Value::from(1_i64))
    );
    assert!(cursor.next().await.unwrap().is_some());
    assert!(cursor.next().await.unwrap().is_none());
}

#[tokio::test]
async fn result_handler_sees_every_row() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT id FROM users</select>
           </mapper>"#,
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id"],
            vec![vec![Value::from(1_i64)], vec![Value::from(2_i64)]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let mut seen = 0usize;
    let mut handler = |_row: &Value| {
        seen += 1;
    };
    session
        .select_with_handler("U.all", Value::Null, RowBounds::default(), &mut handler)
        .await
        .unwrap();
    assert_eq!(seen, 2);
}

#[tokio::test]
async fn handler_queries_bypass_the_local_cache() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="all" resultType="map">SELECT id FROM users</select>
           </mapper>"#,
    );
    script.expect_query("FROM users", result_set(&["id"], vec![vec![Value::from(1_i64)]]));

    let mut session = factory.open_session().unwrap();
    let mut seen = 0usize;
    let mut handler = |_row: &Value| {
        seen += 1;
    };
    session
        .select_with_handler("U.all", Value::Null, RowBounds::default(), &mut handler)
        .await
        .unwrap();
    session
        .select_with_handler("U.all", Value::Null, RowBounds::default(), &mut handler)
        .await
        .unwrap();
    assert_eq!(seen, 2);

    // Handler invocations carry the null key: neither call was cached, and
    // a later plain select still misses.
    assert_eq!(script.execution_count(), 2);
    session.select_list("U.all", Value::Null).await.unwrap();
    assert_eq!(script.execution_count(), 3);
}

// ==================== Generated keys ====================

#[tokio::test]
async fn driver_generated_keys_flow_into_the_parameter() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <insert id="create" useGeneratedKeys="true" keyProperty="id">
               INSERT INTO users (name) VALUES (#{name})
             </insert>
           </mapper>"#,
    );
    script.expect(
        Fixture::matching("INSERT INTO users")
            .affecting(1)
            .with_generated_keys(result_set(&["id"], vec![vec![Value::from(99_i64)]])),
    );

    let mut session = factory.open_session().unwrap();
    let mut user = obj(vec![("name", Value::from("Ann"))]);
    let rows = session.insert("U.create", &mut user).await.unwrap();
    assert_eq!(rows, 1);
    assert_eq!(
        user.as_object().unwrap().get("id"),
        Some(&Value::from(99_i64))
    );
}

#[tokio::test]
async fn select_key_runs_before_the_insert() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <insert id="create">
               <selectKey keyProperty="id" resultType="long" order="BEFORE">SELECT seq_next()</selectKey>
               INSERT INTO users (id, name) VALUES (#{id}, #{name})
             </insert>
           </mapper>"#,
    );
    script.expect_query("seq_next", result_set(&["id"], vec![vec![Value::from(42_i64)]]));
    script.expect_update("INSERT INTO users", 1);

    let mut session = factory.open_session().unwrap();
    let mut user = obj(vec![("name", Value::from("Ann"))]);
    session.insert("U.create", &mut user).await.unwrap();

    let executed = script.executed_sql();
    assert!(executed[0].contains("seq_next"));
    assert!(executed[1].contains("INSERT INTO users"));
    let insert = &script.executed()[1];
    assert_eq!(
        insert.params,
        vec![Value::from(42_i64), Value::from("Ann")]
    );
    assert_eq!(
        user.as_object().unwrap().get("id"),
        Some(&Value::from(42_i64))
    );
}

// ==================== Batch executor ====================

#[tokio::test]
async fn batch_executor_defers_writes_until_flush() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <insert id="create">INSERT INTO users (name) VALUES (#{name})</insert>
           </mapper>"#,
    );
    script.expect_update("INSERT INTO users", 1);

    let mut session = factory
        .open_session_with(ExecutorType::Batch, false, None)
        .unwrap();
    let sentinel = session
        .insert("U.create", &mut obj(vec![("name", Value::from("Ann"))]))
        .await
        .unwrap();
    session
        .insert("U.create", &mut obj(vec![("name", Value::from("Bob"))]))
        .await
        .unwrap();
    assert!(sentinel < 0);
    assert_eq!(script.execution_count(), 0);

    let results = session.flush_statements().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].update_counts, vec![1, 1]);
    assert_eq!(results[0].parameters.len(), 2);
    assert_eq!(script.execution_count(), 2);
    session.close().await.unwrap();
}

// ==================== Commit / rollback ====================

#[tokio::test]
async fn commit_is_skipped_for_clean_sessions() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <select id="one" resultType="map">SELECT 1 AS one</select>
           </mapper>"#,
    );
    let mut session = factory.open_session().unwrap();
    session.select_list("U.one", Value::Null).await.unwrap();
    session.commit(false).await.unwrap();
    assert!(!script
        .events()
        .contains(&sqlweave_rdbc::stub::ConnectionEvent::Committed));

    session.commit(true).await.unwrap();
    assert!(script
        .events()
        .contains(&sqlweave_rdbc::stub::ConnectionEvent::Committed));
}

#[tokio::test]
async fn dirty_sessions_commit_and_rollback() {
    let (factory, script) = setup(
        r#"<mapper namespace="U">
             <update id="touch">UPDATE users SET t = 1</update>
           </mapper>"#,
    );
    let mut session = factory.open_session().unwrap();
    session.update("U.touch", &mut Value::Null).await.unwrap();
    session.rollback(false).await.unwrap();
    assert!(script
        .events()
        .contains(&sqlweave_rdbc::stub::ConnectionEvent::RolledBack));
}

// ==================== Mapper facade ====================

sqlweave::mapper! {
    pub struct UserMapper("user") {
        select_one find_by_id(id);
        select_list find_by_name_and_age(name, age);
        delete remove(id);
    }
}

#[tokio::test]
async fn mapper_facade_packs_and_routes() {
    let (factory, script) = setup(
        r#"<mapper namespace="user">
             <select id="find_by_id" resultType="map">SELECT id FROM users WHERE id = #{id}</select>
             <select id="find_by_name_and_age" resultType="map">
               SELECT id FROM users WHERE name = #{name} AND age = #{age}
             </select>
             <delete id="remove">DELETE FROM users WHERE id = #{id}</delete>
           </mapper>"#,
    );
    script.expect_query(
        "WHERE id = ?",
        result_set(&["id"], vec![vec![Value::from(7_i64)]]),
    );
    script.expect_update("DELETE FROM users", 1);

    let mut session = factory.open_session().unwrap();
    let users = session.mapper::<UserMapper>().unwrap();

    let found = users.find_by_id(&mut session, 7_i64).await.unwrap();
    assert!(found.is_some());

    users
        .find_by_name_and_age(&mut session, "Ann", 30_i64)
        .await
        .unwrap();
    let multi = &script.executed()[1];
    assert_eq!(multi.params, vec![Value::from("Ann"), Value::from(30_i64)]);

    assert_eq!(users.remove(&mut session, 7_i64).await.unwrap(), 1);
}

#[tokio::test]
async fn mapper_for_unknown_namespace_fails() {
    let (factory, _script) = setup(
        r#"<mapper namespace="other">
             <select id="x" resultType="map">SELECT 1</select>
           </mapper>"#,
    );
    let session = factory.open_session().unwrap();
    assert!(session.mapper::<UserMapper>().is_err());
}
