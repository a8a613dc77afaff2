use serde::{Deserialize, Serialize};

pub mod chunk;
pub mod document_meta;
pub mod pipeline_event;

/// A row addressed by `table:id`.
pub trait StoredObject: Serialize + for<'de> Deserialize<'de> {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// Serde adapters between SurrealDB wire values and plain Rust types.
pub mod surreal_serde {
    /// Record ids arrive either as plain strings or as `Thing` maps.
    pub mod record_id {
        use std::fmt;

        use serde::de::{self, Deserializer, MapAccess, Visitor};
        use serde::{Deserialize, Serializer};
        use surrealdb::sql::Thing;

        struct RecordIdVisitor;

        impl<'de> Visitor<'de> for RecordIdVisitor {
            type Value = String;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a record id string or thing")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
                Ok(value.to_owned())
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
                Ok(value)
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<String, A::Error> {
                let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(thing.id.to_raw())
            }
        }

        pub fn serialize<S: Serializer>(id: &str, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(id)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
            deserializer.deserialize_any(RecordIdVisitor)
        }
    }

    pub mod datetime {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use surrealdb::sql::Datetime;

        pub fn serialize<S: Serializer>(
            value: &DateTime<Utc>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            Datetime::from(*value).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<DateTime<Utc>, D::Error> {
            Datetime::deserialize(deserializer).map(DateTime::<Utc>::from)
        }
    }

    pub mod option_datetime {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use surrealdb::sql::Datetime;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.map(Datetime::from).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Ok(Option::<Datetime>::deserialize(deserializer)?.map(DateTime::<Utc>::from))
        }
    }
}

/// Declares a row struct with `id`, `created_at` and `updated_at` plus the given fields.
#[macro_export]
macro_rules! stored_object {
    ($name:ident, $table:expr, {$($(#[$attr:meta])* $field:ident: $ty:ty),*}) => {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Serialize};
        use $crate::storage::types::StoredObject;

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub struct $name {
            #[serde(with = "crate::storage::types::surreal_serde::record_id")]
            pub id: String,
            #[serde(with = "crate::storage::types::surreal_serde::datetime", default)]
            pub created_at: DateTime<Utc>,
            #[serde(with = "crate::storage::types::surreal_serde::datetime", default)]
            pub updated_at: DateTime<Utc>,
            $( $(#[$attr])* pub $field: $ty),*
        }

        impl StoredObject for $name {
            fn table_name() -> &'static str {
                $table
            }

            fn get_id(&self) -> &str {
                &self.id
            }
        }
    };
}
