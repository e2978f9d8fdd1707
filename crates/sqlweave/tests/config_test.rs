//! Configuration markup tests

use std::sync::Arc;

use sqlweave::prelude::*;
use sqlweave_rdbc::stub::{result_set, StubDataSource, StubDriver, StubScript};
use sqlweave_rdbc::Value;

const USER_MAPPER: &str = r#"<mapper namespace="user">
  <select id="findById" resultType="User">SELECT id, user_name FROM users WHERE id = #{id}</select>
  <select id="stubOnly" resultType="map" databaseId="stub">SELECT 1 AS one</select>
  <select id="oracleOnly" resultType="map" databaseId="oracle">SELECT 1 FROM dual</select>
</mapper>"#;

#[tokio::test]
async fn configuration_markup_assembles_a_working_factory() {
    let ds = Arc::new(StubDataSource::new());
    let script = ds.script().clone();
    script.expect_query(
        "FROM users",
        result_set(
            &["id", "user_name"],
            vec![vec![Value::from(7_i64), Value::from("Ann")]],
        ),
    );

    let config = XmlConfigBuilder::new()
        .register_data_source("stub", ds)
        .add_mapper_xml("user.xml", USER_MAPPER)
        .build(
            r#"<configuration>
                 <settings>
                   <setting name="mapUnderscoreToCamelCase" value="true"/>
                   <setting name="defaultExecutorType" value="REUSE"/>
                 </settings>
                 <typeAliases>
                   <typeAlias alias="User" type="map"/>
                 </typeAliases>
                 <environments default="dev">
                   <environment id="dev">
                     <transactionManager type="MANAGED"/>
                     <dataSource type="PROVIDED">
                       <property name="name" value="stub"/>
                     </dataSource>
                   </environment>
                 </environments>
                 <databaseIdProvider>
                   <property name="StubDB" value="stub"/>
                 </databaseIdProvider>
               </configuration>"#,
        )
        .await
        .unwrap();

    assert_eq!(config.database_id.as_deref(), Some("stub"));
    assert!(config.settings.map_underscore_to_camel_case);
    assert_eq!(config.settings.default_executor_type, ExecutorType::Reuse);

    // databaseId filtering kept the stub statement and dropped the other.
    assert!(config.registry.statement("user.stubOnly").is_ok());
    assert!(config.registry.statement("user.oracleOnly").is_err());

    let factory = SessionFactory::new(config);
    let mut session = factory.open_session().unwrap();
    let user = session
        .select_one("user.findById", 7_i64)
        .await
        .unwrap()
        .unwrap();
    // user_name was camelized by the underscore setting.
    assert_eq!(
        user.as_object().unwrap().get("userName"),
        Some(&Value::from("Ann"))
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn pooled_data_source_from_markup() {
    let script = Arc::new(StubScript::default());
    let driver = Arc::new(StubDriver::with_script(script.clone()));

    let config = XmlConfigBuilder::new()
        .register_driver("stub", driver)
        .add_mapper_xml(
            "t.xml",
            r#"<mapper namespace="t">
                 <select id="one" resultType="map">SELECT 1 AS one</select>
               </mapper>"#,
        )
        .build(
            r#"<configuration>
                 <environments default="dev">
                   <environment id="dev">
                     <transactionManager type="MANAGED"/>
                     <dataSource type="POOLED">
                       <property name="driver" value="stub"/>
                       <property name="url" value="stub://pooled"/>
                       <property name="poolMaximumActiveConnections" value="3"/>
                       <property name="poolTimeToWait" value="500"/>
                     </dataSource>
                   </environment>
                 </environments>
               </configuration>"#,
        )
        .await
        .unwrap();

    script.expect_query("SELECT 1", result_set(&["one"], vec![vec![Value::from(1_i64)]]));
    let factory = SessionFactory::new(config);
    let mut session = factory.open_session().unwrap();
    assert!(session.select_one("t.one", Value::Null).await.unwrap().is_some());
    session.close().await.unwrap();

    // The session's connection came from (and returned to) the pool.
    assert_eq!(script.connections_opened(), 1);
    let mut again = factory.open_session().unwrap();
    again.select_one("t.one", Value::Null).await.unwrap();
    again.close().await.unwrap();
    assert_eq!(script.connections_opened(), 1);
}

#[tokio::test]
async fn unknown_setting_fails_the_build() {
    let err = XmlConfigBuilder::new()
        .build(
            r#"<configuration>
                 <settings><setting name="frobnicate" value="true"/></settings>
               </configuration>"#,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigUnknownSetting);
}

#[tokio::test]
async fn malformed_markup_fails_the_build() {
    let err = XmlConfigBuilder::new()
        .build("<configuration><environments>")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigMalformed);

    let err = XmlConfigBuilder::new()
        .add_mapper_xml("bad.xml", "<mapper>no namespace</mapper>")
        .build("<configuration/>")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigMalformed);
}

#[tokio::test]
async fn external_transactions_never_commit() {
    let ds = Arc::new(StubDataSource::new());
    let script = ds.script().clone();

    let config = XmlConfigBuilder::new()
        .register_data_source("stub", ds)
        .add_mapper_xml(
            "t.xml",
            r#"<mapper namespace="t">
                 <update id="touch">UPDATE t SET x = 1</update>
               </mapper>"#,
        )
        .build(
            r#"<configuration>
                 <environments default="dev">
                   <environment id="dev">
                     <transactionManager type="EXTERNAL"/>
                     <dataSource type="PROVIDED">
                       <property name="name" value="stub"/>
                     </dataSource>
                   </environment>
                 </environments>
               </configuration>"#,
        )
        .await
        .unwrap();

    let factory = SessionFactory::new(config);
    let mut session = factory.open_session().unwrap();
    session.update("t.touch", &mut Value::Null).await.unwrap();
    session.commit(true).await.unwrap();
    session.close().await.unwrap();

    use sqlweave_rdbc::stub::ConnectionEvent;
    let events = script.events();
    assert!(!events.contains(&ConnectionEvent::Committed));
    assert!(!events.contains(&ConnectionEvent::RolledBack));
    // The connection itself was still released.
    assert!(events.contains(&ConnectionEvent::Closed));
}
