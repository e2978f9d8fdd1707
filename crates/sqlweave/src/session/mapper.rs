//! Mapper facades
//!
//! `getMapper`-style typed access without runtime proxies: the
//! [`crate::mapper!`] macro generates a facade struct whose methods delegate
//! to session operations using `namespace.method` statement ids and the
//! standard parameter packing rules.

use indexmap::IndexMap;
use sqlweave_rdbc::Value;

/// Pack mapper-method arguments into a statement parameter:
///
/// - zero arguments → `Null`
/// - one non-collection argument → the value itself
/// - one collection argument → named entries plus `param1`, `collection`,
///   `list`, and `array`
/// - several arguments → named entries plus ordered `param1..paramN`
pub fn pack_args(args: Vec<(String, Value)>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => {
            let (name, value) = args.into_iter().next().expect("one argument");
            match value {
                Value::Array(_) => {
                    let mut map = IndexMap::new();
                    map.insert(name, value.clone());
                    map.insert("param1".to_string(), value.clone());
                    map.insert("collection".to_string(), value.clone());
                    map.insert("list".to_string(), value.clone());
                    map.insert("array".to_string(), value);
                    Value::Object(map)
                }
                other => other,
            }
        }
        _ => {
            let mut map = IndexMap::new();
            for (i, (name, value)) in args.into_iter().enumerate() {
                map.insert(format!("param{}", i + 1), value.clone());
                map.insert(name, value);
            }
            Value::Object(map)
        }
    }
}

/// Generate a typed mapper facade over a namespace.
///
/// ```rust,ignore
/// sqlweave::mapper! {
///     pub struct UserMapper("user") {
///         select_list find_all();
///         select_one find_by_id(id);
///         insert create(user);
///         update touch(id, stamp);
///         delete remove(id);
///     }
/// }
///
/// let users = session.mapper::<UserMapper>()?;
/// let found = users.find_by_id(&mut session, 7_i64).await?;
/// ```
///
/// Method names double as statement ids under the declared namespace.
/// `insert` methods take a single `&mut Value` so generated keys flow back
/// to the caller; other kinds take `impl Into<Value>` arguments packed per
/// the standard rules.
#[macro_export]
macro_rules! mapper {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident ($ns:literal) {
            $( $kind:ident $method:ident ( $($arg:ident),* $(,)? ) ; )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name;

        impl $crate::session::Mapper for $name {
            const NAMESPACE: &'static str = $ns;
            fn new() -> Self {
                $name
            }
        }

        impl $name {
            $( $crate::mapper_method!($kind $method ($($arg),*) in $ns); )*
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! mapper_method {
    (select_one $method:ident ($($arg:ident),*) in $ns:literal) => {
        pub async fn $method(
            &self,
            session: &mut $crate::session::Session,
            $($arg: impl Into<$crate::Value>),*
        ) -> $crate::error::Result<Option<$crate::Value>> {
            let parameter = $crate::session::pack_args(vec![
                $((stringify!($arg).to_string(), $arg.into())),*
            ]);
            session
                .select_one(concat!($ns, ".", stringify!($method)), parameter)
                .await
        }
    };
    (select_list $method:ident ($($arg:ident),*) in $ns:literal) => {
        pub async fn $method(
            &self,
            session: &mut $crate::session::Session,
            $($arg: impl Into<$crate::Value>),*
        ) -> $crate::error::Result<Vec<$crate::Value>> {
            let parameter = $crate::session::pack_args(vec![
                $((stringify!($arg).to_string(), $arg.into())),*
            ]);
            session
                .select_list(concat!($ns, ".", stringify!($method)), parameter)
                .await
        }
    };
    (insert $method:ident ($arg:ident) in $ns:literal) => {
        pub async fn $method(
            &self,
            session: &mut $crate::session::Session,
            $arg: &mut $crate::Value,
        ) -> $crate::error::Result<i64> {
            session
                .insert(concat!($ns, ".", stringify!($method)), $arg)
                .await
        }
    };
    (update $method:ident ($($arg:ident),*) in $ns:literal) => {
        pub async fn $method(
            &self,
            session: &mut $crate::session::Session,
            $($arg: impl Into<$crate::Value>),*
        ) -> $crate::error::Result<i64> {
            let mut parameter = $crate::session::pack_args(vec![
                $((stringify!($arg).to_string(), $arg.into())),*
            ]);
            session
                .update(concat!($ns, ".", stringify!($method)), &mut parameter)
                .await
        }
    };
    (delete $method:ident ($($arg:ident),*) in $ns:literal) => {
        pub async fn $method(
            &self,
            session: &mut $crate::session::Session,
            $($arg: impl Into<$crate::Value>),*
        ) -> $crate::error::Result<i64> {
            let parameter = $crate::session::pack_args(vec![
                $((stringify!($arg).to_string(), $arg.into())),*
            ]);
            session
                .delete(concat!($ns, ".", stringify!($method)), parameter)
                .await
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_args_pack_to_null() {
        assert_eq!(pack_args(vec![]), Value::Null);
    }

    #[test]
    fn single_scalar_packs_to_itself() {
        assert_eq!(
            pack_args(vec![("id".to_string(), Value::from(7_i64))]),
            Value::from(7_i64)
        );
    }

    #[test]
    fn single_object_packs_to_itself() {
        let object = Value::Object(
            [("a".to_string(), Value::from(1_i64))].into_iter().collect(),
        );
        assert_eq!(
            pack_args(vec![("user".to_string(), object.clone())]),
            object
        );
    }

    #[test]
    fn single_collection_exposes_aliases() {
        let list = Value::Array(vec![Value::from(1_i64), Value::from(2_i64)]);
        let packed = pack_args(vec![("ids".to_string(), list.clone())]);
        let map = packed.as_object().unwrap();
        assert_eq!(map.get("ids"), Some(&list));
        assert_eq!(map.get("param1"), Some(&list));
        assert_eq!(map.get("collection"), Some(&list));
        assert_eq!(map.get("list"), Some(&list));
        assert_eq!(map.get("array"), Some(&list));
    }

    #[test]
    fn multiple_args_pack_named_and_positional() {
        let packed = pack_args(vec![
            ("name".to_string(), Value::from("Ann")),
            ("age".to_string(), Value::from(30_i64)),
        ]);
        let map = packed.as_object().unwrap();
        assert_eq!(map.get("name"), Some(&Value::from("Ann")));
        assert_eq!(map.get("param1"), Some(&Value::from("Ann")));
        assert_eq!(map.get("age"), Some(&Value::from(30_i64)));
        assert_eq!(map.get("param2"), Some(&Value::from(30_i64)));
    }
}
