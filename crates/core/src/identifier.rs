//! Default identifier derivation
//!
//! Derives backend-safe identifiers deterministically from logical names:
//! lowercase, non-alphanumeric characters folded to `_`, components joined
//! with `_`, and field/scalar identifiers suffixed with the type
//! discriminator so that the same name under two types yields two columns.
//! Long identifiers are clamped to [`MAX_IDENTIFIER_LEN`] bytes with a
//! hash suffix to keep them distinct.

use crate::path::PathKey;
use crate::traits::IdentifierFactory;
use crate::types::FieldType;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maximum identifier length, chosen to fit common backend limits.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Stateless [`IdentifierFactory`] producing deterministic identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIdentifierFactory;

impl DefaultIdentifierFactory {
    fn sanitize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
            } else {
                out.push('_');
            }
        }
        if out.is_empty() {
            out.push('_');
        }
        out
    }

    fn clamp(candidate: String) -> String {
        if candidate.len() <= MAX_IDENTIFIER_LEN {
            return candidate;
        }
        let mut hasher = DefaultHasher::new();
        candidate.hash(&mut hasher);
        let suffix = format!("_{:08x}", hasher.finish() as u32);
        let keep = MAX_IDENTIFIER_LEN - suffix.len();
        let mut cut = keep;
        while !candidate.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{}", &candidate[..cut], suffix)
    }
}

impl IdentifierFactory for DefaultIdentifierFactory {
    fn database_identifier(&self, name: &str) -> String {
        Self::clamp(Self::sanitize(name))
    }

    fn collection_identifier(&self, database_id: &str, name: &str) -> String {
        Self::clamp(format!("{}_{}", database_id, Self::sanitize(name)))
    }

    fn doc_part_identifier(&self, collection_id: &str, path: &PathKey) -> String {
        if path.is_root() {
            return Self::clamp(collection_id.to_string());
        }
        let mut candidate = String::from(collection_id);
        for segment in path.segments() {
            candidate.push('_');
            candidate.push_str(&Self::sanitize(segment));
        }
        Self::clamp(candidate)
    }

    fn field_identifier(&self, doc_part_id: &str, name: &str, field_type: FieldType) -> String {
        Self::clamp(format!(
            "{}_{}_{}",
            doc_part_id,
            Self::sanitize(name),
            field_type.discriminator()
        ))
    }

    fn scalar_identifier(&self, doc_part_id: &str, field_type: FieldType) -> String {
        Self::clamp(format!("{}_v_{}", doc_part_id, field_type.discriminator()))
    }

    fn index_identifier(&self, doc_part_id: &str, column_identifiers: &[&str]) -> String {
        let mut hasher = DefaultHasher::new();
        for column in column_identifiers {
            column.hash(&mut hasher);
        }
        Self::clamp(format!(
            "{}_idx_{:08x}",
            doc_part_id,
            hasher.finish() as u32
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_identifier_is_sanitized() {
        let factory = DefaultIdentifierFactory;
        assert_eq!(factory.database_identifier("My-DB"), "my_db");
        assert_eq!(factory.database_identifier("日本"), "__");
    }

    #[test]
    fn test_field_identifier_carries_type_discriminator() {
        let factory = DefaultIdentifierFactory;
        let as_int = factory.field_identifier("tbl", "age", FieldType::Integer);
        let as_str = factory.field_identifier("tbl", "age", FieldType::String);
        assert_eq!(as_int, "tbl_age_i");
        assert_eq!(as_str, "tbl_age_s");
        assert_ne!(as_int, as_str);
    }

    #[test]
    fn test_doc_part_identifier_root_is_collection_id() {
        let factory = DefaultIdentifierFactory;
        assert_eq!(
            factory.doc_part_identifier("db_col", &PathKey::root()),
            "db_col"
        );
        assert_eq!(
            factory.doc_part_identifier("db_col", &PathKey::root().child("tags")),
            "db_col_tags"
        );
    }

    #[test]
    fn test_long_identifiers_are_clamped_and_distinct() {
        let factory = DefaultIdentifierFactory;
        let long_a = "a".repeat(100);
        let long_b = format!("{}b", "a".repeat(100));
        let id_a = factory.database_identifier(&long_a);
        let id_b = factory.database_identifier(&long_b);
        assert!(id_a.len() <= MAX_IDENTIFIER_LEN);
        assert!(id_b.len() <= MAX_IDENTIFIER_LEN);
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_index_identifier_depends_on_columns() {
        let factory = DefaultIdentifierFactory;
        let one = factory.index_identifier("tbl", &["a", "b"]);
        let other = factory.index_identifier("tbl", &["b", "a"]);
        assert_ne!(one, other);
    }

    #[test]
    fn test_deterministic() {
        let factory = DefaultIdentifierFactory;
        assert_eq!(
            factory.collection_identifier("db", "users"),
            factory.collection_identifier("db", "users")
        );
    }
}
