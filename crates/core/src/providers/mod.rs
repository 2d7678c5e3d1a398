pub mod ollama;
pub mod rerank;

pub use ollama::{OllamaEmbedder, OllamaGenerator};
pub use rerank::HttpReranker;

use crate::error::CapabilityError;
use url::Url;

/// Resolves `path` under `base`, keeping any path prefix `base` already has.
pub(crate) fn endpoint_url(base: &str, path: &str) -> Result<Url, CapabilityError> {
    let mut url = Url::parse(base.trim())?;
    if url.cannot_be_a_base() {
        return Err(CapabilityError::Unavailable(format!(
            "endpoint {base} cannot be used as a base url"
        )));
    }
    if !url.path().ends_with('/') {
        let prefix = format!("{}/", url.path());
        url.set_path(&prefix);
    }
    Ok(url.join(path.trim_start_matches('/'))?)
}
