use serde::{Deserialize, Serialize};

/// Where a declared dependency comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum DependencySource {
    /// `path = "../token"`, relative to the declaring manifest's directory.
    Path(String),
    /// `name.workspace = true`, matched against other contracts by name.
    Workspace,
    /// A versioned registry dependency. Never produces an edge.
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub source: DependencySource,
}

impl DependencySpec {
    pub fn path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: DependencySource::Path(path.into()),
        }
    }

    pub fn workspace(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: DependencySource::Workspace,
        }
    }

    pub fn registry(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: DependencySource::Registry,
        }
    }
}

/// One deployable contract as described by its already-parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub cargo_toml_path: String,
    pub contract_dir: String,
    pub contract_name: String,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub build_dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub dev_dependencies: Vec<DependencySpec>,
}

impl ArtifactDescriptor {
    /// Descriptor for a contract living in `contract_dir` with a
    /// `Cargo.toml` directly inside it.
    pub fn new(contract_name: impl Into<String>, contract_dir: impl Into<String>) -> Self {
        let contract_dir = contract_dir.into();
        let cargo_toml_path = format!("{}/Cargo.toml", contract_dir.trim_end_matches(['/', '\\']));
        Self {
            cargo_toml_path,
            contract_dir,
            contract_name: contract_name.into(),
            dependencies: Vec::new(),
            build_dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_build_dependency(mut self, dep: DependencySpec) -> Self {
        self.build_dependencies.push(dep);
        self
    }

    pub fn with_dev_dependency(mut self, dep: DependencySpec) -> Self {
        self.dev_dependencies.push(dep);
        self
    }

    /// Normalised manifest path; the artifact's unique key.
    pub fn key(&self) -> String {
        normalize_path(&self.cargo_toml_path)
    }

    /// Normalised directory holding the manifest.
    pub fn manifest_dir(&self) -> String {
        parent_dir(&self.key())
    }
}

/// Lexically canonicalises a path: `\` becomes `/`, empty and `.` segments
/// are dropped, `..` pops the previous segment and trailing slashes go away.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // `..` above a relative root is kept, above `/` it is dropped
                _ if !absolute => segments.push(".."),
                _ => {}
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Resolves `relative` against `base_dir` and normalises the result.
pub fn join_path(base_dir: &str, relative: &str) -> String {
    let relative = relative.replace('\\', "/");
    if relative.starts_with('/') || base_dir.is_empty() || base_dir == "." {
        normalize_path(&relative)
    } else {
        normalize_path(&format!("{base_dir}/{relative}"))
    }
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unifies_separators_and_trailing_slashes() {
        assert_eq!(normalize_path("contracts\\token\\"), "contracts/token");
        assert_eq!(normalize_path("contracts//token/./Cargo.toml"), "contracts/token/Cargo.toml");
        assert_eq!(normalize_path("/ws/contracts/"), "/ws/contracts");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("./"), ".");
    }

    #[test]
    fn normalize_resolves_parent_segments() {
        assert_eq!(normalize_path("contracts/nft/../token"), "contracts/token");
        assert_eq!(normalize_path("../shared/lib"), "../shared/lib");
        assert_eq!(normalize_path("/a/../../b"), "/b");
    }

    #[test]
    fn join_is_relative_to_base() {
        assert_eq!(join_path("ws/contracts/nft", "../token"), "ws/contracts/token");
        assert_eq!(join_path("ws/nft", "/abs/token"), "/abs/token");
        assert_eq!(join_path(".", "token"), "token");
    }

    #[test]
    fn descriptor_key_and_dir() {
        let artifact = ArtifactDescriptor::new("token", "ws\\contracts\\token\\");
        assert_eq!(artifact.key(), "ws/contracts/token/Cargo.toml");
        assert_eq!(artifact.manifest_dir(), "ws/contracts/token");

        let root = ArtifactDescriptor {
            cargo_toml_path: "Cargo.toml".to_string(),
            ..artifact
        };
        assert_eq!(root.manifest_dir(), ".");
    }
}
