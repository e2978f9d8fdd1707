//! # sqlweave
//!
//! A declarative SQL mapping and execution framework. Mapping markup relates
//! parameterized SQL statements to application objects and result shapes;
//! sqlweave compiles those definitions into a statement registry, renders
//! dynamic SQL per invocation, executes through the `sqlweave-rdbc` driver
//! contract, materializes rows into objects, and caches results across
//! sessions.
//!
//! For application code that wants full SQL control rather than ORM-style
//! object graphs.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use sqlweave::prelude::*;
//!
//! let mut config = Configuration::with_environment(Environment::new(
//!     "dev",
//!     TransactionFactory::Managed,
//!     data_source,
//! ));
//! let mut compiler = MapperCompiler::new();
//! compiler.compile(&mut config, r#"
//!     <mapper namespace="user">
//!       <select id="findById" resultType="map">
//!         SELECT id, name FROM users WHERE id = #{id}
//!       </select>
//!     </mapper>"#)?;
//! compiler.finish(&mut config)?;
//!
//! let factory = SessionFactory::new(config);
//! let mut session = factory.open_session()?;
//! let user = session.select_one("user.findById", 7_i64).await?;
//! session.close().await?;
//! ```
//!
//! ## Architecture
//!
//! - [`compile`] — XML mapping compiler with two-phase forward-reference
//!   resolution
//! - [`dynsql`] — dynamic SQL trees, the expression engine, and the
//!   placeholder pass producing bound SQL
//! - [`registry`] — the immutable statement catalog
//! - [`executor`] — simple/reuse/batch executors, the caching decorator,
//!   statement and result-set handling
//! - [`cache`] — composable cache decorators plus the transactional manager
//!   staging second-tier writes until commit
//! - [`convert`] — the (application type × driver type) converter registry
//! - [`meta`] — compiled accessor tables and property paths
//! - [`session`] — the public session facade and mapper macro

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod compile;
pub mod config;
pub mod convert;
pub mod dynsql;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod meta;
pub mod registry;
pub mod session;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{Cache, CacheBuilder, CacheKey, EvictionPolicy};
    pub use crate::compile::{MapperCompiler, XmlConfigBuilder};
    pub use crate::config::{
        AutoMappingBehavior, Configuration, Environment, ExecutorType, LocalCacheScope, Settings,
        TransactionFactory, UnknownColumnBehavior,
    };
    pub use crate::convert::{AppType, Converter, ConverterRegistry};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::executor::{BatchResult, ResultHandler, RowBounds, RowCursor};
    pub use crate::mapping::{
        BoundSql, KeyGeneratorKind, MappedStatement, ParameterMapping, ResultMap, ResultMapping,
        SqlCommandType, StatementType,
    };
    pub use crate::meta::{MetaRegistry, TypeDescriptor};
    pub use crate::session::{pack_args, Mapper, Session, SessionFactory};

    pub use sqlweave_rdbc::prelude::*;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use sqlweave_rdbc::{DriverType, Row, Value};
