//! Schema runtime: the table of exchange schemas and product classes the
//! converter understands.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

/// Where to load the schema runtime from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeLocator {
    /// Compiled-in table.
    #[default]
    Builtin,
    /// JSON file with the same shape as [`SchemaRuntime`].
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRuntime {
    pub name: String,
    /// Accepted `FILE_SCHEMA` identifiers, upper case.
    pub schemas: BTreeSet<String>,
    /// Entity keywords treated as building elements, upper case.
    pub product_classes: BTreeSet<String>,
}

const BUILTIN_SCHEMAS: &[&str] = &["IFC2X3", "IFC4", "IFC4X3"];

const BUILTIN_PRODUCTS: &[&str] = &[
    "IFCBEAM",
    "IFCBUILDINGELEMENTPROXY",
    "IFCCOLUMN",
    "IFCCOVERING",
    "IFCCURTAINWALL",
    "IFCDOOR",
    "IFCFLOWSEGMENT",
    "IFCFLOWTERMINAL",
    "IFCFOOTING",
    "IFCFURNISHINGELEMENT",
    "IFCMEMBER",
    "IFCPILE",
    "IFCPLATE",
    "IFCRAILING",
    "IFCRAMP",
    "IFCROOF",
    "IFCSLAB",
    "IFCSTAIR",
    "IFCSTAIRFLIGHT",
    "IFCWALL",
    "IFCWALLSTANDARDCASE",
    "IFCWINDOW",
];

impl SchemaRuntime {
    pub fn builtin() -> Self {
        Self {
            name: "builtin".into(),
            schemas: BUILTIN_SCHEMAS.iter().map(|s| s.to_string()).collect(),
            product_classes: BUILTIN_PRODUCTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn load(locator: &RuntimeLocator) -> Result<Self, ConversionError> {
        match locator {
            RuntimeLocator::Builtin => Ok(Self::builtin()),
            RuntimeLocator::Path(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConversionError::Runtime(format!("cannot read {}: {e}", path.display()))
                })?;
                let mut runtime: Self = serde_json::from_str(&text).map_err(|e| {
                    ConversionError::Runtime(format!("invalid runtime {}: {e}", path.display()))
                })?;
                runtime.schemas = runtime.schemas.iter().map(|s| s.to_uppercase()).collect();
                runtime.product_classes = runtime
                    .product_classes
                    .iter()
                    .map(|s| s.to_uppercase())
                    .collect();
                if runtime.product_classes.is_empty() {
                    return Err(ConversionError::Runtime(format!(
                        "runtime {} lists no product classes",
                        path.display()
                    )));
                }
                tracing::debug!(
                    runtime = %runtime.name,
                    products = runtime.product_classes.len(),
                    "loaded schema runtime"
                );
                Ok(runtime)
            }
        }
    }

    pub fn supports_schema(&self, schema: &str) -> bool {
        self.schemas.contains(&schema.to_uppercase())
    }

    pub fn is_product(&self, keyword: &str) -> bool {
        self.product_classes.contains(keyword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_knows_common_classes() {
        let rt = SchemaRuntime::load(&RuntimeLocator::Builtin).unwrap();
        assert!(rt.is_product("IFCWALL"));
        assert!(rt.is_product("IFCSLAB"));
        assert!(!rt.is_product("IFCCARTESIANPOINT"));
        assert!(rt.supports_schema("ifc4"));
        assert!(!rt.supports_schema("AP214"));
    }

    #[test]
    fn loads_runtime_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(
            &path,
            r#"{"name":"walls-only","schemas":["ifc4"],"product_classes":["IfcWall"]}"#,
        )
        .unwrap();

        let rt = SchemaRuntime::load(&RuntimeLocator::Path(path)).unwrap();
        assert_eq!(rt.name, "walls-only");
        assert!(rt.is_product("IFCWALL"));
        assert!(!rt.is_product("IFCSLAB"));
        assert!(rt.supports_schema("IFC4"));
    }

    #[test]
    fn missing_runtime_file_is_runtime_error() {
        let err = SchemaRuntime::load(&RuntimeLocator::Path("/nonexistent/rt.json".into()))
            .unwrap_err();
        assert!(matches!(err, ConversionError::Runtime(_)));
    }

    #[test]
    fn empty_runtime_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"name":"x","schemas":[],"product_classes":[]}"#).unwrap();
        let err = SchemaRuntime::load(&RuntimeLocator::Path(path)).unwrap_err();
        assert!(matches!(err, ConversionError::Runtime(_)));
    }
}
