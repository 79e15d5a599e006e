//! Binary name to version lookup.

use crate::errors::ContainerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Deployment details for a container binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryInfo {
    /// Version tag to launch.
    pub version: String,
    /// Scratch directory inside the container.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    /// Repository the binary is pulled from.
    #[serde(default)]
    pub repository_path: String,
}

fn default_tmp_dir() -> String {
    "/tmp/".to_string()
}

impl BinaryInfo {
    /// Creates binary info with the default scratch directory.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            tmp_dir: default_tmp_dir(),
            repository_path: String::new(),
        }
    }
}

/// Resolves a binary name to its deployment details.
pub trait BinaryResolver: Send + Sync {
    /// Looks up a binary.
    fn resolve(&self, binary_name: &str) -> Result<BinaryInfo, ContainerError>;
}

/// Resolver backed by a static map, usually built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticBinaryResolver {
    binaries: HashMap<String, BinaryInfo>,
}

impl StaticBinaryResolver {
    /// Creates a resolver from a map.
    #[must_use]
    pub fn new(binaries: HashMap<String, BinaryInfo>) -> Self {
        Self { binaries }
    }

    /// Adds or replaces a binary.
    #[must_use]
    pub fn with_binary(mut self, name: impl Into<String>, info: BinaryInfo) -> Self {
        self.binaries.insert(name.into(), info);
        self
    }
}

impl BinaryResolver for StaticBinaryResolver {
    fn resolve(&self, binary_name: &str) -> Result<BinaryInfo, ContainerError> {
        self.binaries
            .get(binary_name)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownBinary {
                name: binary_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_binary() {
        let resolver = StaticBinaryResolver::default()
            .with_binary("pid/private-id-server", BinaryInfo::new("rc"));

        let info = resolver.resolve("pid/private-id-server").unwrap();
        assert_eq!(info.version, "rc");
        assert_eq!(info.tmp_dir, "/tmp/");
    }

    #[test]
    fn test_resolve_unknown_binary() {
        let resolver = StaticBinaryResolver::default();
        let err = resolver.resolve("missing").unwrap_err();
        assert!(matches!(err, ContainerError::UnknownBinary { name } if name == "missing"));
    }
}
