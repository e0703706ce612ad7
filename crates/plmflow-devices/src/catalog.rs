/*!
 * Device descriptor catalog.
 *
 * Maps a device's category and subcategory to the product keys it may carry
 * and, per product key, the named features to instantiate.
 */
use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::feature::FeatureRegistry;

const DEFAULT_CATALOG: &str = include_str!("device_catalog.toml");

/// Error raised while loading a catalog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog document could not be parsed
    #[error("cannot parse catalog: {0}")]
    Parse(String),

    /// A product key names a feature type nobody can construct
    #[error(
        "cat {category:#04x} subcat {subcategory:#04x} product key {product_key}: \
         feature {feature} has unknown type {feature_type}"
    )]
    UnknownFeatureType {
        /// Device category
        category: u8,
        /// Device subcategory
        subcategory: u8,
        /// Product key the feature belongs to
        product_key: String,
        /// Feature name
        feature: String,
        /// The unknown type name
        feature_type: String,
    },

    /// The same category/subcategory pair appears twice
    #[error("cat {0:#04x} subcat {1:#04x} defined more than once")]
    Duplicate(u8, u8),
}

/// Identity of a device as reported by link tables or product queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    /// Device category
    pub category: u8,
    /// Device subcategory
    pub subcategory: u8,
    /// Firmware version
    pub version: u8,
}

impl DeviceDescriptor {
    /// Create a descriptor
    pub fn new(category: u8, subcategory: u8, version: u8) -> Self {
        Self {
            category,
            subcategory,
            version,
        }
    }

    /// Compact form used in device listings
    pub fn to_short_string(&self) -> String {
        format!("{:02X}.{:02X}.{:02X}", self.category, self.subcategory, self.version)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cat {:#04x} subcat {:#04x} fw {:#04x}",
            self.category, self.subcategory, self.version
        )
    }
}

/// Feature name to feature type name
pub type FeatureSet = IndexMap<String, String>;

/// One subcategory of a device category
#[derive(Debug, Clone, Deserialize)]
pub struct SubCategory {
    /// Subcategory number
    pub id: u8,
    /// Human readable model name
    #[serde(default)]
    pub name: String,
    /// Product key to the features it yields
    #[serde(default)]
    pub product_keys: IndexMap<String, FeatureSet>,
}

impl SubCategory {
    /// Create an empty subcategory
    pub fn new<S: Into<String>>(id: u8, name: S) -> Self {
        Self {
            id,
            name: name.into(),
            product_keys: IndexMap::new(),
        }
    }

    /// Add a product key and its `(feature name, feature type)` pairs
    pub fn with_product_key<I, N, T>(mut self, product_key: &str, features: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        let features = features
            .into_iter()
            .map(|(name, feature_type)| (name.into(), feature_type.into()))
            .collect();
        self.product_keys.insert(product_key.to_string(), features);
        self
    }
}

#[derive(Debug, Deserialize)]
struct Category {
    id: u8,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "subcategory")]
    subcategories: Vec<SubCategory>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "category")]
    categories: Vec<Category>,
}

/// Lookup table from (category, subcategory) to product keys and features
#[derive(Debug, Default, Clone)]
pub struct DeviceCatalog {
    subcategories: HashMap<(u8, u8), SubCategory>,
    category_names: HashMap<u8, String>,
}

impl DeviceCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog shipped in `device_catalog.toml`
    pub fn with_defaults(registry: &FeatureRegistry) -> Result<Self, CatalogError> {
        Self::from_toml_str(DEFAULT_CATALOG, registry)
    }

    /// Load a catalog from TOML, rejecting any feature type `registry`
    /// cannot construct
    pub fn from_toml_str(s: &str, registry: &FeatureRegistry) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(s).map_err(|e| CatalogError::Parse(e.to_string()))?;

        let mut catalog = Self::new();
        for category in file.categories {
            catalog.category_names.insert(category.id, category.name);
            for subcategory in category.subcategories {
                catalog.validate(category.id, &subcategory, registry)?;
                catalog.insert(category.id, subcategory)?;
            }
        }
        debug!("loaded catalog with {} subcategories", catalog.subcategories.len());
        Ok(catalog)
    }

    fn validate(
        &self,
        category: u8,
        subcategory: &SubCategory,
        registry: &FeatureRegistry,
    ) -> Result<(), CatalogError> {
        for (product_key, features) in &subcategory.product_keys {
            for (feature, feature_type) in features {
                if !registry.contains(feature_type) {
                    return Err(CatalogError::UnknownFeatureType {
                        category,
                        subcategory: subcategory.id,
                        product_key: product_key.clone(),
                        feature: feature.clone(),
                        feature_type: feature_type.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Add a subcategory without checking its feature types
    pub fn insert(&mut self, category: u8, subcategory: SubCategory) -> Result<(), CatalogError> {
        let key = (category, subcategory.id);
        if self.subcategories.contains_key(&key) {
            return Err(CatalogError::Duplicate(category, subcategory.id));
        }
        self.subcategories.insert(key, subcategory);
        Ok(())
    }

    /// Builder form of [`DeviceCatalog::insert`]
    pub fn with_subcategory(mut self, category: u8, subcategory: SubCategory) -> Result<Self, CatalogError> {
        self.insert(category, subcategory)?;
        Ok(self)
    }

    /// Find the subcategory entry for a device
    pub fn lookup(&self, category: u8, subcategory: u8) -> Option<&SubCategory> {
        self.subcategories.get(&(category, subcategory))
    }

    /// Features a descriptor yields under `product_key`
    pub fn features_for(&self, descriptor: &DeviceDescriptor, product_key: &str) -> Option<&FeatureSet> {
        self.lookup(descriptor.category, descriptor.subcategory)
            .and_then(|sub| sub.product_keys.get(product_key))
    }

    /// Display name of a category, if the catalog defines one
    pub fn category_name(&self, category: u8) -> Option<&str> {
        self.category_names.get(&category).map(String::as_str)
    }

    /// Number of subcategories known
    pub fn len(&self) -> usize {
        self.subcategories.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.subcategories.is_empty()
    }
}
