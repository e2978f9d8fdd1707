//! Mapping compiler
//!
//! Consumes configuration and mapping markup and populates the statement
//! registry. Forward references (cache-ref targets, `extends` bases, nested
//! result maps, sql fragments, statements) are kept as pending items and
//! retried after every mapper file; whatever is still unresolved when the
//! build finishes fails with `ConfigIncomplete`.

pub mod script;
pub mod xml;

use indexmap::IndexMap;
use sqlweave_rdbc::driver::{DataSource, Driver};
use sqlweave_rdbc::pool::{PoolConfig, PooledDataSource};
use sqlweave_rdbc::unpooled::UnpooledDataSource;
use sqlweave_rdbc::DriverType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheBuilder, EvictionPolicy};
use crate::config::{Configuration, Environment, TransactionFactory};
use crate::convert::AppType;
use crate::error::{Error, ErrorKind, Result};
use crate::mapping::{
    Discriminator, KeyGeneratorKind, MappedStatement, ParameterMap, ParameterMode, ResultMap,
    ResultMapping, SqlCommandType, StatementType,
};

use xml::XmlElement;

fn qualify(namespace: &str, id: &str) -> String {
    if id.contains('.') {
        id.to_string()
    } else {
        format!("{namespace}.{id}")
    }
}

fn is_incomplete(e: &Error) -> bool {
    e.kind == ErrorKind::ConfigIncomplete
}

enum Pending {
    CacheRef { namespace: String, target: String },
    ResultMap { namespace: String, element: XmlElement },
    Statement { namespace: String, element: XmlElement },
}

/// Compiles mapper files into a [`Configuration`]'s registry.
#[derive(Default)]
pub struct MapperCompiler {
    fragments: HashMap<String, XmlElement>,
    pending: Vec<Pending>,
}

impl MapperCompiler {
    /// Create a compiler with no pending work
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one mapper document, then retry everything still pending.
    pub fn compile(&mut self, config: &mut Configuration, xml_text: &str) -> Result<()> {
        let root = XmlElement::parse(xml_text)?;
        if root.name != "mapper" {
            return Err(Error::malformed(format!(
                "expected <mapper> root element, found <{}>",
                root.name
            )));
        }
        let namespace = root.required_attr("namespace")?.to_string();
        debug!(namespace = %namespace, "compiling mapper");

        // Fragments first so includes in this file resolve immediately.
        for sql in root.elements("sql") {
            let id = qualify(&namespace, sql.required_attr("id")?);
            self.fragments.insert(id, sql.clone());
        }

        for cache_ref in root.elements("cache-ref") {
            let target = cache_ref.required_attr("namespace")?.to_string();
            if config.registry.has_cache(&target) {
                config.registry.add_cache_ref(namespace.clone(), target);
            } else {
                self.pending.push(Pending::CacheRef {
                    namespace: namespace.clone(),
                    target,
                });
            }
        }

        if let Some(cache) = root.first("cache") {
            build_cache(config, &namespace, cache)?;
        }

        for pm in root.elements("parameterMap") {
            build_parameter_map(config, &namespace, pm)?;
        }

        for rm in root.elements("resultMap") {
            match build_result_map(config, &namespace, rm) {
                Ok(()) => {}
                Err(e) if is_incomplete(&e) => self.pending.push(Pending::ResultMap {
                    namespace: namespace.clone(),
                    element: rm.clone(),
                }),
                Err(e) => return Err(e),
            }
        }

        for statement in root
            .child_elements()
            .filter(|e| matches!(e.name.as_str(), "select" | "insert" | "update" | "delete"))
        {
            match self.build_statement(config, &namespace, statement) {
                Ok(()) => {}
                Err(e) if is_incomplete(&e) => self.pending.push(Pending::Statement {
                    namespace: namespace.clone(),
                    element: statement.clone(),
                }),
                Err(e) => return Err(e),
            }
        }

        self.retry(config)
    }

    /// Retry pending items until no further progress is made
    pub fn retry(&mut self, config: &mut Configuration) -> Result<()> {
        loop {
            let before = self.pending.len();
            let pending = std::mem::take(&mut self.pending);
            for item in pending {
                let outcome = match &item {
                    Pending::CacheRef { namespace, target } => {
                        if config.registry.has_cache(target) {
                            config
                                .registry
                                .add_cache_ref(namespace.clone(), target.clone());
                            Ok(())
                        } else {
                            Err(Error::incomplete(format!(
                                "cache-ref from '{namespace}' to missing namespace '{target}'"
                            )))
                        }
                    }
                    Pending::ResultMap { namespace, element } => {
                        build_result_map(config, namespace, element)
                    }
                    Pending::Statement { namespace, element } => {
                        self.build_statement(config, namespace, element)
                    }
                };
                match outcome {
                    Ok(()) => {}
                    Err(e) if is_incomplete(&e) => self.pending.push(item),
                    Err(e) => return Err(e),
                }
            }
            if self.pending.len() >= before {
                return Ok(());
            }
        }
    }

    /// Finish the build: anything still pending is an error
    pub fn finish(&mut self, config: &mut Configuration) -> Result<()> {
        self.retry(config)?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut subjects = Vec::new();
        for item in &self.pending {
            subjects.push(match item {
                Pending::CacheRef { namespace, target } => {
                    format!("cache-ref {namespace} -> {target}")
                }
                Pending::ResultMap { namespace, element } => format!(
                    "resultMap {}.{}",
                    namespace,
                    element.attr("id").unwrap_or("?")
                ),
                Pending::Statement { namespace, element } => format!(
                    "statement {}.{}",
                    namespace,
                    element.attr("id").unwrap_or("?")
                ),
            });
        }
        Err(Error::incomplete(format!(
            "unresolved references at end of build: {}",
            subjects.join(", ")
        )))
    }

    fn build_statement(
        &self,
        config: &mut Configuration,
        namespace: &str,
        element: &XmlElement,
    ) -> Result<()> {
        let id = element.required_attr("id")?;
        let full_id = qualify(namespace, id);
        let command_type = match element.name.as_str() {
            "select" => SqlCommandType::Select,
            "insert" => SqlCommandType::Insert,
            "update" => SqlCommandType::Update,
            "delete" => SqlCommandType::Delete,
            other => {
                return Err(Error::malformed(format!(
                    "unknown statement element <{other}>"
                )))
            }
        };

        // Database-id filtering.
        let declared_db = element.attr("databaseId").map(str::to_string);
        match (&config.database_id, &declared_db) {
            (Some(current), Some(declared)) if current != declared => return Ok(()),
            (None, Some(_)) => return Ok(()),
            (Some(_), None) => {
                if let Ok(existing) = config.registry.statement(&full_id) {
                    if existing.database_id.is_some() {
                        // A databaseId-matched statement already owns the id.
                        return Ok(());
                    }
                }
            }
            _ => {}
        }

        let expanded = script::expand_includes(element, namespace, &self.fragments)?;

        // Companion select-key statement.
        let mut key_generator = KeyGeneratorKind::None;
        let mut key_properties: Vec<String> = split_list(element.attr("keyProperty"));
        let key_columns: Vec<String> = split_list(element.attr("keyColumn"));
        if let Some(select_key) = expanded.first("selectKey") {
            let key_id = format!("{full_id}!selectKey");
            let execute_before = select_key
                .attr("order")
                .map(|o| o.eq_ignore_ascii_case("BEFORE"))
                .unwrap_or(false);
            key_properties = split_list(select_key.attr("keyProperty"));
            if !config.registry.has_statement(&key_id) {
                let inline_id = format!("{key_id}-Inline");
                register_inline_result_map(
                    config,
                    &inline_id,
                    select_key.attr("resultType").unwrap_or("map"),
                )?;
                let source = script::build_sql_source(select_key)?;
                let key_ms = MappedStatement::builder(&key_id, SqlCommandType::Select, source)
                    .result_maps(vec![inline_id])
                    .use_cache(false)
                    .flush_cache(false)
                    .build();
                config.registry.add_statement(key_ms)?;
            }
            key_generator = KeyGeneratorKind::SelectKey {
                statement_id: key_id,
                execute_before,
            };
        } else {
            let wants_keys = element.bool_attr(
                "useGeneratedKeys",
                config.settings.use_generated_keys && command_type == SqlCommandType::Insert,
            )?;
            if wants_keys && command_type.is_write() {
                key_generator = KeyGeneratorKind::DriverGenerated;
            }
        }

        // Result shape: explicit maps or an inline one from resultType.
        let mut result_maps = Vec::new();
        if let Some(attr) = element.attr("resultMap") {
            for rm_id in attr.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let qualified = qualify(namespace, rm_id);
                // Missing maps defer this statement.
                config.registry.result_map(&qualified)?;
                result_maps.push(qualified);
            }
        } else if let Some(result_type) = element.attr("resultType") {
            let inline_id = format!("{full_id}-Inline");
            register_inline_result_map(config, &inline_id, result_type)?;
            result_maps.push(inline_id);
        }

        let parameter_map = match element.attr("parameterMap") {
            Some(pm) => {
                let qualified = qualify(namespace, pm);
                config.registry.parameter_map(&qualified)?;
                Some(qualified)
            }
            None => None,
        };

        // The body excludes the selectKey element.
        let mut body = expanded.clone();
        body.children.retain(|c| match c {
            xml::XmlChild::Element(e) => e.name != "selectKey",
            xml::XmlChild::Text(_) => true,
        });
        let sql_source = script::build_sql_source(&body)?;

        let statement_type = match element.attr("statementType") {
            None => StatementType::Prepared,
            Some(t) => match t.to_ascii_uppercase().as_str() {
                "STATEMENT" => StatementType::Statement,
                "PREPARED" => StatementType::Prepared,
                "CALLABLE" => StatementType::Callable,
                other => {
                    return Err(Error::malformed(format!(
                        "unknown statementType '{other}' on '{full_id}'"
                    )))
                }
            },
        };

        let fetch_size = match element.attr("fetchSize") {
            Some(v) => Some(v.parse().map_err(|_| {
                Error::malformed(format!("bad fetchSize '{v}' on '{full_id}'"))
            })?),
            None => None,
        };
        let timeout = match element.attr("timeout") {
            Some(v) => Some(Duration::from_secs(v.parse().map_err(|_| {
                Error::malformed(format!("bad timeout '{v}' on '{full_id}'"))
            })?)),
            None => None,
        };

        let statement = MappedStatement::builder(&full_id, command_type, sql_source)
            .statement_type(statement_type)
            .parameter_map(parameter_map)
            .result_maps(result_maps)
            .fetch_size(fetch_size)
            .timeout(timeout)
            .flush_cache(element.bool_attr("flushCache", command_type.is_write())?)
            .use_cache(element.bool_attr("useCache", !command_type.is_write())?)
            .key_generator(key_generator)
            .key_properties(key_properties)
            .key_columns(key_columns)
            .database_id(declared_db.clone())
            .result_sets(split_list(element.attr("resultSets")))
            .build();

        if declared_db.is_some() && config.registry.has_statement(&full_id) {
            // The databaseId-matched statement shadows a bare registration.
            config.registry.replace_statement(statement);
        } else {
            config.registry.add_statement(statement)?;
        }
        Ok(())
    }
}

fn split_list(attr: Option<&str>) -> Vec<String> {
    attr.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn register_inline_result_map(
    config: &mut Configuration,
    id: &str,
    result_type: &str,
) -> Result<()> {
    if config.registry.has_result_map(id) {
        return Ok(());
    }
    let type_name = config.resolve_type_name(result_type).to_string();
    config
        .registry
        .add_result_map(ResultMap::new(id, type_name, Vec::new()))
}

fn build_cache(config: &mut Configuration, namespace: &str, element: &XmlElement) -> Result<()> {
    let eviction = match element.attr("eviction") {
        None => EvictionPolicy::Lru,
        Some(name) => EvictionPolicy::parse(name)
            .ok_or_else(|| Error::malformed(format!("unknown cache eviction '{name}'")))?,
    };
    let mut builder = CacheBuilder::new(namespace)
        .eviction(eviction)
        .read_write(!element.bool_attr("readOnly", false)?)
        .blocking(element.bool_attr("blocking", false)?);
    if let Some(size) = element.attr("size") {
        builder = builder.capacity(size.parse().map_err(|_| {
            Error::malformed(format!("bad cache size '{size}' in '{namespace}'"))
        })?);
    }
    if let Some(interval) = element.attr("flushInterval") {
        builder = builder.clear_interval(Duration::from_millis(interval.parse().map_err(
            |_| Error::malformed(format!("bad flushInterval '{interval}' in '{namespace}'")),
        )?));
    }
    for property in element.elements("property") {
        if property.attr("name") == Some("timeout") {
            let value = property.required_attr("value")?;
            builder = builder.blocking_timeout(Duration::from_millis(value.parse().map_err(
                |_| Error::malformed(format!("bad cache timeout '{value}' in '{namespace}'")),
            )?));
        }
    }
    config.registry.add_cache(builder.build());
    Ok(())
}

fn build_parameter_map(
    config: &mut Configuration,
    namespace: &str,
    element: &XmlElement,
) -> Result<()> {
    let id = qualify(namespace, element.required_attr("id")?);
    let mut mappings = Vec::new();
    for parameter in element.elements("parameter") {
        let mut mapping =
            crate::mapping::ParameterMapping::of(parameter.required_attr("property")?);
        if let Some(t) = parameter.attr("javaType") {
            mapping.app_type = AppType::parse(config.resolve_type_name(t));
        }
        if let Some(t) = parameter.attr("jdbcType") {
            mapping.driver_type = DriverType::parse(t)
                .ok_or_else(|| Error::malformed(format!("unknown jdbcType '{t}' in '{id}'")))?;
        }
        if let Some(mode) = parameter.attr("mode") {
            mapping.mode = match mode.to_ascii_uppercase().as_str() {
                "IN" => ParameterMode::In,
                "OUT" => ParameterMode::Out,
                "INOUT" => ParameterMode::InOut,
                other => {
                    return Err(Error::malformed(format!(
                        "unknown parameter mode '{other}' in '{id}'"
                    )))
                }
            };
        }
        if let Some(scale) = parameter.attr("numericScale") {
            mapping.numeric_scale = Some(scale.parse().map_err(|_| {
                Error::malformed(format!("bad numericScale '{scale}' in '{id}'"))
            })?);
        }
        if let Some(converter) = parameter.attr("typeHandler") {
            mapping.converter = Some(converter.to_string());
        }
        if let Some(rm) = parameter.attr("resultMap") {
            mapping.result_map = Some(qualify(namespace, rm));
        }
        mappings.push(mapping);
    }
    config.registry.add_parameter_map(ParameterMap { id, mappings })
}

fn build_result_map(
    config: &mut Configuration,
    namespace: &str,
    element: &XmlElement,
) -> Result<()> {
    let id = qualify(namespace, element.required_attr("id")?);
    if config.registry.has_result_map(&id) {
        // Retried after a partial earlier pass.
        return Ok(());
    }
    let type_name = config
        .resolve_type_name(element.required_attr("type")?)
        .to_string();

    let mut mappings: Vec<ResultMapping> = Vec::new();
    if let Some(extends) = element.attr("extends") {
        let base = config.registry.result_map(&qualify(namespace, extends))?;
        mappings.extend(base.mappings.iter().cloned());
    }

    if let Some(constructor) = element.first("constructor") {
        for (i, arg) in constructor.child_elements().enumerate() {
            let mut mapping = build_result_mapping(config, namespace, &id, arg, i)?;
            mapping.constructor_flag = true;
            mapping.id_flag = arg.name == "idArg";
            mappings.push(mapping);
        }
    }

    let mut discriminator = None;
    for (i, child) in element.child_elements().enumerate() {
        match child.name.as_str() {
            "id" | "result" | "association" | "collection" => {
                let mut mapping = build_result_mapping(config, namespace, &id, child, i)?;
                mapping.id_flag = child.name == "id";
                mapping.collection = child.name == "collection";
                mappings.push(mapping);
            }
            "discriminator" => {
                let column = child.required_attr("column")?.to_string();
                let mut cases = IndexMap::new();
                for case in child.elements("case") {
                    let value = case.required_attr("value")?.to_string();
                    let target = if let Some(rm) = case.attr("resultMap") {
                        qualify(namespace, rm)
                    } else {
                        // Inline case body becomes an anonymous result map.
                        let case_id = format!("{id}_case_{value}");
                        build_inline_result_map(
                            config,
                            namespace,
                            &case_id,
                            case.attr("resultType").unwrap_or(&type_name),
                            case,
                        )?;
                        case_id
                    };
                    cases.insert(value, target);
                }
                discriminator = Some(Discriminator {
                    column,
                    app_type: child
                        .attr("javaType")
                        .map(|t| AppType::parse(config.resolve_type_name(t)))
                        .unwrap_or(AppType::String),
                    driver_type: child
                        .attr("jdbcType")
                        .and_then(DriverType::parse)
                        .unwrap_or(DriverType::Undefined),
                    cases,
                });
            }
            _ => {}
        }
    }

    let mut result_map = ResultMap::new(id, type_name, mappings);
    if let Some(d) = discriminator {
        result_map = result_map.with_discriminator(d);
    }
    if let Some(auto) = element.attr("autoMapping") {
        result_map = result_map.with_auto_mapping(auto == "true");
    }
    config.registry.add_result_map(result_map)
}

fn build_inline_result_map(
    config: &mut Configuration,
    namespace: &str,
    id: &str,
    type_name: &str,
    element: &XmlElement,
) -> Result<()> {
    if config.registry.has_result_map(id) {
        return Ok(());
    }
    let mut mappings = Vec::new();
    for (i, child) in element.child_elements().enumerate() {
        match child.name.as_str() {
            "id" | "result" | "association" | "collection" => {
                let mut mapping = build_result_mapping(config, namespace, id, child, i)?;
                mapping.id_flag = child.name == "id";
                mapping.collection = child.name == "collection";
                mappings.push(mapping);
            }
            _ => {}
        }
    }
    let type_name = config.resolve_type_name(type_name).to_string();
    config
        .registry
        .add_result_map(ResultMap::new(id, type_name, mappings))
}

fn parse_composites(column: &str) -> Option<Vec<(String, String)>> {
    let inner = column.strip_prefix('{')?.strip_suffix('}')?;
    let mut composites = Vec::new();
    for pair in inner.split(',') {
        let (property, col) = pair.split_once('=')?;
        composites.push((property.trim().to_string(), col.trim().to_string()));
    }
    Some(composites)
}

fn build_result_mapping(
    config: &mut Configuration,
    namespace: &str,
    owner_id: &str,
    element: &XmlElement,
    index: usize,
) -> Result<ResultMapping> {
    let mut mapping = ResultMapping {
        property: element.attr("property").map(str::to_string),
        ..Default::default()
    };
    if let Some(column) = element.attr("column") {
        match parse_composites(column) {
            Some(composites) => mapping.composites = composites,
            None => mapping.column = Some(column.to_string()),
        }
    }
    if let Some(t) = element.attr("javaType").or_else(|| element.attr("ofType")) {
        mapping.app_type = Some(AppType::parse(config.resolve_type_name(t)));
    }
    if let Some(t) = element.attr("jdbcType") {
        mapping.driver_type = DriverType::parse(t).ok_or_else(|| {
            Error::malformed(format!("unknown jdbcType '{t}' in '{owner_id}'"))
        })?;
    }
    if let Some(converter) = element.attr("typeHandler") {
        mapping.converter = Some(converter.to_string());
    }
    mapping.not_null_columns = split_list(element.attr("notNullColumn"));
    mapping.column_prefix = element.attr("columnPrefix").map(str::to_string);
    mapping.lazy = match element.attr("fetchType") {
        Some("lazy") => true,
        Some("eager") => false,
        _ => config.settings.lazy_loading_enabled,
    };

    if let Some(select) = element.attr("select") {
        mapping.nested_select = Some(qualify(namespace, select));
    } else if let Some(rm) = element.attr("resultMap") {
        let qualified = qualify(namespace, rm);
        // A missing nested map defers the whole owning map.
        config.registry.result_map(&qualified)?;
        mapping.nested_result_map = Some(qualified);
    } else if matches!(element.name.as_str(), "association" | "collection") {
        // Inline nested mapping becomes an anonymous result map.
        let inline_id = format!("{owner_id}_inline_{index}");
        let inline_type = element
            .attr("javaType")
            .or_else(|| element.attr("ofType"))
            .unwrap_or("map");
        build_inline_result_map(config, namespace, &inline_id, inline_type, element)?;
        mapping.nested_result_map = Some(inline_id);
    }
    Ok(mapping)
}

// ==================== Configuration markup ====================

/// Builds a [`Configuration`] from configuration markup. Drivers and
/// pre-built data sources are registered by key so the markup can name them.
#[derive(Default)]
pub struct XmlConfigBuilder {
    drivers: HashMap<String, Arc<dyn Driver>>,
    data_sources: HashMap<String, Arc<dyn DataSource>>,
    mappers: Vec<(String, String)>,
}

impl XmlConfigBuilder {
    /// Create a builder with nothing registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under the key data-source properties refer to
    pub fn register_driver(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(name.into(), driver);
        self
    }

    /// Register a pre-built data source for `type="PROVIDED"`
    pub fn register_data_source(
        mut self,
        name: impl Into<String>,
        data_source: Arc<dyn DataSource>,
    ) -> Self {
        self.data_sources.insert(name.into(), data_source);
        self
    }

    /// Add a mapper document directly, in addition to `<mappers>` resources
    pub fn add_mapper_xml(mut self, name: impl Into<String>, xml: impl Into<String>) -> Self {
        self.mappers.push((name.into(), xml.into()));
        self
    }

    /// Parse the configuration document and compile every mapper.
    pub async fn build(self, xml_text: &str) -> Result<Configuration> {
        let root = XmlElement::parse(xml_text)?;
        if root.name != "configuration" {
            return Err(Error::malformed(format!(
                "expected <configuration> root element, found <{}>",
                root.name
            )));
        }

        let mut config = Configuration::new();

        if let Some(settings) = root.first("settings") {
            for setting in settings.elements("setting") {
                config.settings.apply(
                    setting.required_attr("name")?,
                    setting.required_attr("value")?,
                )?;
            }
        }

        if let Some(aliases) = root.first("typeAliases") {
            for alias in aliases.elements("typeAlias") {
                config.add_type_alias(
                    alias.required_attr("alias")?,
                    alias.required_attr("type")?,
                );
            }
        }

        if let Some(environments) = root.first("environments") {
            let default_id = environments.required_attr("default")?;
            let environment = environments
                .elements("environment")
                .find(|e| e.attr("id") == Some(default_id))
                .ok_or_else(|| {
                    Error::malformed(format!("default environment '{default_id}' is not defined"))
                })?;
            config.environment = Some(self.build_environment(environment)?);
        }

        if let Some(provider) = root.first("databaseIdProvider") {
            let mut products: HashMap<String, String> = HashMap::new();
            for property in provider.elements("property") {
                products.insert(
                    property.required_attr("name")?.to_string(),
                    property.required_attr("value")?.to_string(),
                );
            }
            if let Some(environment) = &config.environment {
                let mut conn = environment.data_source.connection().await?;
                let product = conn.database_product().to_string();
                let _ = conn.close().await;
                config.database_id = products.get(&product).cloned();
            }
        }

        let mut sources = Vec::new();
        if let Some(mappers) = root.first("mappers") {
            for mapper in mappers.elements("mapper") {
                let resource = mapper.required_attr("resource")?;
                let content = std::fs::read_to_string(resource).map_err(|e| {
                    Error::malformed(format!("could not read mapper resource '{resource}': {e}"))
                })?;
                sources.push((resource.to_string(), content));
            }
        }
        sources.extend(self.mappers.clone());

        let mut compiler = MapperCompiler::new();
        for (name, content) in &sources {
            compiler
                .compile(&mut config, content)
                .map_err(|e| Error::new(e.kind, format!("in mapper '{name}': {}", e.message)))?;
        }
        compiler.finish(&mut config)?;
        Ok(config)
    }

    fn build_environment(&self, element: &XmlElement) -> Result<Environment> {
        let id = element.required_attr("id")?;
        let tx = element
            .first("transactionManager")
            .ok_or_else(|| Error::malformed("environment is missing <transactionManager>"))?;
        let transaction_factory = TransactionFactory::parse(tx.required_attr("type")?)?;

        let ds_element = element
            .first("dataSource")
            .ok_or_else(|| Error::malformed("environment is missing <dataSource>"))?;
        let ds_type = ds_element.required_attr("type")?.to_ascii_uppercase();
        let mut props: IndexMap<String, String> = IndexMap::new();
        for property in ds_element.elements("property") {
            props.insert(
                property.required_attr("name")?.to_string(),
                property.required_attr("value")?.to_string(),
            );
        }

        let data_source: Arc<dyn DataSource> = match ds_type.as_str() {
            "PROVIDED" => {
                let name = props
                    .get("name")
                    .ok_or_else(|| Error::malformed("PROVIDED dataSource needs a 'name'"))?;
                self.data_sources
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::malformed(format!("no data source registered under '{name}'"))
                    })?
            }
            "UNPOOLED" => Arc::new(self.build_unpooled(&props)?),
            "POOLED" => {
                let unpooled = self.build_unpooled(&props)?;
                Arc::new(PooledDataSource::with_config(
                    unpooled,
                    pool_config_from(&props)?,
                ))
            }
            other => {
                return Err(Error::malformed(format!(
                    "unknown dataSource type '{other}'"
                )))
            }
        };

        Ok(Environment::new(id, transaction_factory, data_source))
    }

    fn build_unpooled(&self, props: &IndexMap<String, String>) -> Result<UnpooledDataSource> {
        let driver_key = props
            .get("driver")
            .ok_or_else(|| Error::malformed("dataSource needs a 'driver' property"))?;
        let driver = self.drivers.get(driver_key).cloned().ok_or_else(|| {
            Error::malformed(format!("no driver registered under '{driver_key}'"))
        })?;
        let url = props
            .get("url")
            .ok_or_else(|| Error::malformed("dataSource needs a 'url' property"))?;
        let mut ds = UnpooledDataSource::new(driver, url.clone());
        if let (Some(username), Some(password)) = (props.get("username"), props.get("password")) {
            ds = ds.with_credentials(username.clone(), password.clone());
        }
        Ok(ds)
    }
}

fn pool_config_from(props: &IndexMap<String, String>) -> Result<PoolConfig> {
    let mut config = PoolConfig::default();
    for (name, value) in props {
        let bad = || Error::malformed(format!("bad pool property '{name}'='{value}'"));
        match name.as_str() {
            "poolMaximumActiveConnections" => {
                config.max_active = value.parse().map_err(|_| bad())?
            }
            "poolMaximumIdleConnections" => config.max_idle = value.parse().map_err(|_| bad())?,
            "poolMaximumCheckoutTime" => {
                config.max_checkout_time = Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            "poolTimeToWait" => {
                config.time_to_wait = Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            "poolMaximumLocalBadConnectionTolerance" => {
                config.bad_connection_tolerance = value.parse().map_err(|_| bad())?
            }
            "poolPingQuery" => config.ping_query = value.clone(),
            "poolPingEnabled" => config.ping_enabled = value == "true",
            "poolPingConnectionsNotUsedFor" => {
                config.ping_not_used_for = Duration::from_millis(value.parse().map_err(|_| bad())?)
            }
            _ => {}
        }
    }
    Ok(config)
}
