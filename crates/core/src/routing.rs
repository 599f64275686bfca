//! Classification of request paths into the endpoint families the edge manages.

/// Path used for the sitemap endpoint when none is configured.
pub const DEFAULT_SITEMAP_PATH: &str = "/llm-sitemap.json";

/// Path used for the manifest endpoint when none is configured.
pub const DEFAULT_MANIFEST_PATH: &str = "/llms.txt";

/// Which of the edge-managed endpoint families a request path belongs to.
///
/// The flags are independent of each other; a path may match none of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteClass {
    /// The path ends in `/llm` or `/llm/`.
    pub llm_endpoint: bool,
    /// The path is exactly the configured sitemap path.
    pub sitemap: bool,
    /// The path is exactly the configured manifest path.
    pub manifest: bool,
}

impl RouteClass {
    /// Classify a request path against the configured sitemap and manifest paths.
    pub fn classify(path: &str, sitemap_path: &str, manifest_path: &str) -> Self {
        Self {
            llm_endpoint: is_llm_endpoint(path),
            sitemap: path == sitemap_path,
            manifest: path == manifest_path,
        }
    }

    /// Whether the edge rewrites headers for this path at all.
    pub fn is_classified(&self) -> bool {
        self.llm_endpoint || self.sitemap || self.manifest
    }
}

fn is_llm_endpoint(path: &str) -> bool {
    let path = path.strip_suffix('/').unwrap_or(path);
    path.ends_with("/llm")
}

/// Replace the trailing `/llm` or `/llm/` segment of a path with `/`.
///
/// Returns [`None`] if the path is not an LLM endpoint.
pub fn canonical_path(path: &str) -> Option<String> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let prefix = trimmed.strip_suffix("/llm")?;
    Some(format!("{prefix}/"))
}
