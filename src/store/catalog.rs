//! Metadata Catalog
//!
//! Registered metadata formats (`prefix -> schema/namespace`) and sets
//! (`setSpec -> setName`), independent of any record. A format or set can
//! carry descriptive metadata before the first record uses it; records
//! referencing unregistered names auto-register them with empty
//! descriptors, which a later explicit registration upgrades.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Schema/namespace pair describing a metadata format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub schema: String,
    pub namespace: String,
}

/// Public view of one registered metadata format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFormat {
    pub prefix: String,
    pub schema: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub prefixes: BTreeMap<String, FormatDescriptor>,
    pub sets: BTreeMap<String, String>,
}

impl Catalog {
    /// Idempotent upsert; returns true when the stored entry changed.
    pub fn register_prefix(&mut self, prefix: &str, schema: &str, namespace: &str) -> bool {
        let descriptor = FormatDescriptor {
            schema: schema.to_string(),
            namespace: namespace.to_string(),
        };
        match self.prefixes.get(prefix) {
            Some(existing) if *existing == descriptor => false,
            _ => {
                self.prefixes.insert(prefix.to_string(), descriptor);
                true
            }
        }
    }

    /// Idempotent upsert; returns true when the stored entry changed.
    pub fn register_set(&mut self, set_spec: &str, set_name: &str) -> bool {
        match self.sets.get(set_spec) {
            Some(existing) if existing == set_name => false,
            _ => {
                self.sets.insert(set_spec.to_string(), set_name.to_string());
                true
            }
        }
    }

    /// Register with empty descriptors unless already known.
    pub fn ensure_prefix(&mut self, prefix: &str) -> bool {
        if self.prefixes.contains_key(prefix) {
            return false;
        }
        self.prefixes
            .insert(prefix.to_string(), FormatDescriptor::default());
        true
    }

    /// Register with an empty name unless already known.
    pub fn ensure_set(&mut self, set_spec: &str) -> bool {
        if self.sets.contains_key(set_spec) {
            return false;
        }
        self.sets.insert(set_spec.to_string(), String::new());
        true
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.prefixes.contains_key(prefix)
    }

    pub fn set_name(&self, set_spec: &str) -> Option<&str> {
        self.sets.get(set_spec).map(String::as_str)
    }

    pub fn all_metadata_formats(&self) -> Vec<MetadataFormat> {
        self.prefixes
            .iter()
            .map(|(prefix, descriptor)| MetadataFormat {
                prefix: prefix.clone(),
                schema: descriptor.schema.clone(),
                namespace: descriptor.namespace.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_upsert() {
        let mut catalog = Catalog::default();
        assert!(catalog.register_prefix("oai_dc", "schema.xsd", "urn:ns"));
        assert!(!catalog.register_prefix("oai_dc", "schema.xsd", "urn:ns"));
        assert!(catalog.register_prefix("oai_dc", "other.xsd", "urn:ns"));
        assert_eq!(catalog.prefixes["oai_dc"].schema, "other.xsd");

        assert!(catalog.register_set("a:b", "Bee"));
        assert!(!catalog.register_set("a:b", "Bee"));
        assert_eq!(catalog.set_name("a:b"), Some("Bee"));
    }

    #[test]
    fn test_ensure_never_overwrites() {
        let mut catalog = Catalog::default();
        catalog.register_prefix("oai_dc", "schema.xsd", "urn:ns");
        assert!(!catalog.ensure_prefix("oai_dc"));
        assert_eq!(catalog.prefixes["oai_dc"].schema, "schema.xsd");

        assert!(catalog.ensure_set("x"));
        assert_eq!(catalog.set_name("x"), Some(""));
        catalog.register_set("x", "Ex");
        assert!(!catalog.ensure_set("x"));
        assert_eq!(catalog.set_name("x"), Some("Ex"));
    }
}
