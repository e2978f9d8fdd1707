//! Cross-session cache and nested-select behavior

use std::sync::Arc;

use sqlweave::prelude::*;
use sqlweave_rdbc::stub::{result_set, StubDataSource, StubScript};
use sqlweave_rdbc::Value;

fn obj(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
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

const CACHED_MAPPER: &str = r#"<mapper namespace="U">
  <cache/>
  <select id="findById" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
  <update id="updateById">UPDATE users SET name = #{name} WHERE id = #{id}</update>
</mapper>"#;

fn select_count(script: &StubScript) -> usize {
    script
        .executed_sql()
        .iter()
        .filter(|s| s.starts_with("SELECT"))
        .count()
}

// ==================== Second-tier cache across sessions ====================

#[tokio::test]
async fn committed_results_are_visible_to_other_sessions() {
    let (factory, script) = setup_with(CACHED_MAPPER, |_| {});
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    // Session A misses, loads from the driver, and commits the cache entry.
    let mut a = factory.open_session().unwrap();
    let first = a.select_one("U.findById", 7_i64).await.unwrap().unwrap();
    assert_eq!(select_count(&script), 1);
    a.commit(false).await.unwrap();
    a.close().await.unwrap();

    // Session B is served from the shared cache without a driver call.
    let mut b = factory.open_session().unwrap();
    let cached = b.select_one("U.findById", 7_i64).await.unwrap().unwrap();
    assert_eq!(select_count(&script), 1);
    assert_eq!(cached, first);

    // Session C writes and commits; the namespace cache is cleared.
    let mut c = factory.open_session().unwrap();
    c.update(
        "U.updateById",
        &mut obj(vec![("id", Value::from(7_i64)), ("name", Value::from("Amy"))]),
    )
    .await
    .unwrap();
    c.commit(false).await.unwrap();
    c.close().await.unwrap();

    // B re-executes against the driver. Its local cache was already cleared
    // by nothing, so clear it explicitly to isolate the second tier.
    b.clear_cache();
    b.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(select_count(&script), 2);
    b.close().await.unwrap();
}

#[tokio::test]
async fn uncommitted_results_stay_invisible() {
    let (factory, script) = setup_with(CACHED_MAPPER, |_| {});
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(select_count(&script), 1);

    // No commit from A: B must hit the driver itself.
    let mut b = factory.open_session().unwrap();
    b.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(select_count(&script), 2);
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn rollback_discards_staged_cache_entries() {
    let (factory, script) = setup_with(CACHED_MAPPER, |_| {});
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", 7_i64).await.unwrap();
    a.rollback(true).await.unwrap();
    a.close().await.unwrap();

    let mut b = factory.open_session().unwrap();
    b.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(select_count(&script), 2);
}

#[tokio::test]
async fn cache_disabled_setting_bypasses_the_shared_cache() {
    let (factory, script) = setup_with(CACHED_MAPPER, |config| {
        config.settings.cache_enabled = false;
    });
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut a = factory.open_session().unwrap();
    a.select_one("U.findById", 7_i64).await.unwrap();
    a.commit(false).await.unwrap();
    a.close().await.unwrap();

    let mut b = factory.open_session().unwrap();
    b.select_one("U.findById", 7_i64).await.unwrap();
    assert_eq!(select_count(&script), 2);
}

// ==================== Nested selects ====================

const NESTED_MAPPER: &str = r#"<mapper namespace="O">
  <resultMap id="orderMap" type="map">
    <id property="id" column="id"/>
    <association property="user" column="user_id" select="findUser"/>
  </resultMap>
  <select id="findOrders" resultMap="orderMap">SELECT id, user_id FROM orders</select>
  <select id="findUser" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
</mapper>"#;

#[tokio::test]
async fn nested_selects_hydrate_associations() {
    let (factory, script) = setup_with(NESTED_MAPPER, |_| {});
    script.expect_query(
        "FROM orders",
        result_set(
            &["id", "user_id"],
            vec![
                vec![Value::from(1_i64), Value::from(7_i64)],
                vec![Value::from(2_i64), Value::from(7_i64)],
            ],
        ),
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let orders = session.select_list("O.findOrders", Value::Null).await.unwrap();
    assert_eq!(orders.len(), 2);

    let user = orders[0].as_object().unwrap().get("user").unwrap();
    assert_eq!(
        user.as_object().unwrap().get("name"),
        Some(&Value::from("Ann"))
    );

    // Both orders share user 7: the second hydration came from the local
    // cache, so only one user query hit the driver.
    let user_queries = script
        .executed_sql()
        .iter()
        .filter(|s| s.contains("FROM users"))
        .count();
    assert_eq!(user_queries, 1);
}

#[tokio::test]
async fn statement_scope_clears_between_top_level_statements_only() {
    let (factory, script) = setup_with(NESTED_MAPPER, |config| {
        config.settings.local_cache_scope = LocalCacheScope::Statement;
    });
    for _ in 0..2 {
        script.expect_query(
            "FROM orders",
            result_set(
                &["id", "user_id"],
                vec![
                    vec![Value::from(1_i64), Value::from(7_i64)],
                    vec![Value::from(2_i64), Value::from(7_i64)],
                ],
            ),
        );
    }
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    session.select_list("O.findOrders", Value::Null).await.unwrap();
    // Within one top-level statement the nested select was deduplicated.
    let user_queries = |script: &StubScript| {
        script
            .executed_sql()
            .iter()
            .filter(|s| s.contains("FROM users"))
            .count()
    };
    assert_eq!(user_queries(&script), 1);

    // A second top-level statement starts from an empty local cache.
    session.select_list("O.findOrders", Value::Null).await.unwrap();
    assert_eq!(user_queries(&script), 2);
    let order_queries = script
        .executed_sql()
        .iter()
        .filter(|s| s.contains("FROM orders"))
        .count();
    assert_eq!(order_queries, 2);
}

const LAZY_NESTED_MAPPER: &str = r#"<mapper namespace="L">
  <resultMap id="orderMap" type="map">
    <id property="id" column="id"/>
    <association property="user" column="user_id" select="findUser" fetchType="lazy"/>
  </resultMap>
  <select id="findOrders" resultMap="orderMap">SELECT id, user_id FROM orders</select>
  <select id="findUser" resultType="map">SELECT id, name FROM users WHERE id = #{id}</select>
</mapper>"#;

#[tokio::test]
async fn lazy_deferred_loads_complete_within_one_statement_scope_pass() {
    let (factory, script) = setup_with(LAZY_NESTED_MAPPER, |config| {
        config.settings.lazy_loading_enabled = true;
        config.settings.local_cache_scope = LocalCacheScope::Statement;
    });
    script.expect_query(
        "FROM orders",
        result_set(
            &["id", "user_id"],
            vec![
                vec![Value::from(1_i64), Value::from(7_i64)],
                vec![Value::from(2_i64), Value::from(7_i64)],
                vec![Value::from(3_i64), Value::from(7_i64)],
            ],
        ),
    );
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let orders = session
        .select_list("L.findOrders", Value::Null)
        .await
        .unwrap();
    assert_eq!(orders.len(), 3);
    for order in &orders {
        let user = order.as_object().unwrap().get("user").unwrap();
        assert_eq!(
            user.as_object().unwrap().get("name"),
            Some(&Value::from("Ann"))
        );
    }

    // All three deferred loads share one nested-select key and ran inside
    // the same statement-scope pass: one driver call, two local cache hits.
    // The scope clear fires only after the whole unit, never between the
    // deferred loads of one statement.
    let user_queries = |script: &StubScript| {
        script
            .executed_sql()
            .iter()
            .filter(|s| s.contains("FROM users"))
            .count()
    };
    assert_eq!(user_queries(&script), 1);

    // The clear still happens between top-level statements.
    session
        .select_list("L.findOrders", Value::Null)
        .await
        .unwrap();
    assert_eq!(user_queries(&script), 2);
}

// ==================== Nested result maps ====================

#[tokio::test]
async fn nested_result_maps_aggregate_by_row_key() {
    let mapper = r#"<mapper namespace="B">
      <resultMap id="orderMap" type="map">
        <id property="id" column="id"/>
        <result property="buyer" column="buyer"/>
        <collection property="items" ofType="map" columnPrefix="item_">
          <id property="sku" column="sku"/>
          <result property="qty" column="qty"/>
        </collection>
      </resultMap>
      <select id="orders" resultMap="orderMap">SELECT * FROM order_lines</select>
    </mapper>"#;
    let (factory, script) = setup_with(mapper, |_| {});
    script.expect_query(
        "FROM order_lines",
        result_set(
            &["id", "buyer", "item_sku", "item_qty"],
            vec![
                vec![
                    Value::from(1_i64),
                    Value::from("Ann"),
                    Value::from("A-1"),
                    Value::from(2_i64),
                ],
                vec![
                    Value::from(1_i64),
                    Value::from("Ann"),
                    Value::from("B-2"),
                    Value::from(1_i64),
                ],
                vec![
                    Value::from(2_i64),
                    Value::from("Bob"),
                    Value::from("A-1"),
                    Value::from(5_i64),
                ],
            ],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let orders = session.select_list("B.orders", Value::Null).await.unwrap();
    assert_eq!(orders.len(), 2);

    let first = orders[0].as_object().unwrap();
    assert_eq!(first.get("buyer"), Some(&Value::from("Ann")));
    let items = first.get("items").unwrap().as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0].as_object().unwrap().get("sku"),
        Some(&Value::from("A-1"))
    );
    assert_eq!(
        items[1].as_object().unwrap().get("sku"),
        Some(&Value::from("B-2"))
    );

    let second = orders[1].as_object().unwrap();
    let items = second.get("items").unwrap().as_array().unwrap();
    assert_eq!(items.len(), 1);
}

// ==================== Discriminators ====================

#[tokio::test]
async fn discriminator_switches_result_shape_per_row() {
    let mapper = r#"<mapper namespace="V">
      <resultMap id="vehicleMap" type="map">
        <id property="id" column="id"/>
        <discriminator javaType="string" column="kind">
          <case value="car" resultMap="carMap"/>
          <case value="truck" resultMap="truckMap"/>
        </discriminator>
      </resultMap>
      <resultMap id="carMap" type="map">
        <id property="id" column="id"/>
        <result property="doors" column="doors"/>
      </resultMap>
      <resultMap id="truckMap" type="map">
        <id property="id" column="id"/>
        <result property="payload" column="payload"/>
      </resultMap>
      <select id="all" resultMap="vehicleMap">SELECT * FROM vehicles</select>
    </mapper>"#;
    let (factory, script) = setup_with(mapper, |_| {});
    script.expect_query(
        "FROM vehicles",
        result_set(
            &["id", "kind", "doors", "payload"],
            vec![
                vec![
                    Value::from(1_i64),
                    Value::from("car"),
                    Value::from(4_i64),
                    Value::Null,
                ],
                vec![
                    Value::from(2_i64),
                    Value::from("truck"),
                    Value::Null,
                    Value::from(9000_i64),
                ],
            ],
        ),
    );

    let mut session = factory.open_session().unwrap();
    let vehicles = session.select_list("V.all", Value::Null).await.unwrap();

    let car = vehicles[0].as_object().unwrap();
    assert_eq!(car.get("doors"), Some(&Value::from(4_i64)));
    let truck = vehicles[1].as_object().unwrap();
    assert_eq!(truck.get("payload"), Some(&Value::from(9000_i64)));
}
