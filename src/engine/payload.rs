//! Script payload assembly.
//!
//! A payload is the ordered list of sources evaluated in every new worker:
//! the bridge prelude, the caller's library sources, then the worker loop.
//! Its SHA-256 fingerprint identifies the bundle in logs and metrics.

use crate::error::Result;
use crate::{BRIDGE_PRELUDE, WORKER_LOOP};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Source name of the bridge prelude
pub const PRELUDE_NAME: &str = "bridge:prelude.js";

/// Source name of the worker loop
pub const WORKER_LOOP_NAME: &str = "bridge:worker.js";

// Hasher already fed with the embedded sources; libraries are appended.
static EMBEDDED_DIGEST: Lazy<Sha256> = Lazy::new(|| {
    let mut hasher = Sha256::new();
    hasher.update(BRIDGE_PRELUDE.as_bytes());
    hasher.update(WORKER_LOOP.as_bytes());
    hasher
});

/// One named script source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    /// Name shown in stack traces and initialization errors
    pub name: String,
    /// Script text
    pub code: String,
}

impl ScriptSource {
    /// Create a source
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

/// Immutable bundle of sources loaded into every worker
#[derive(Debug, Clone)]
pub struct ScriptPayload {
    sources: Vec<ScriptSource>,
    fingerprint: String,
}

impl ScriptPayload {
    /// A payload made of the given library sources.
    ///
    /// The libraries must leave `globalThis.federation` defined for
    /// composition and planning requests to succeed.
    pub fn new(libraries: Vec<ScriptSource>) -> Self {
        let mut hasher = EMBEDDED_DIGEST.clone();
        for library in &libraries {
            hasher.update(library.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(library.code.as_bytes());
        }
        let fingerprint = hex::encode(hasher.finalize());

        let mut sources = Vec::with_capacity(libraries.len() + 2);
        sources.push(ScriptSource::new(PRELUDE_NAME, BRIDGE_PRELUDE));
        sources.extend(libraries);
        sources.push(ScriptSource::new(WORKER_LOOP_NAME, WORKER_LOOP));

        Self {
            sources,
            fingerprint,
        }
    }

    /// A payload with a single library source
    pub fn with_library(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(vec![ScriptSource::new(name, code)])
    }

    /// A payload whose library is read from a bundle file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let code = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), bytes = code.len(), "loaded library bundle");
        Ok(Self::with_library(path.display().to_string(), code))
    }

    /// Every source in evaluation order
    pub fn sources(&self) -> &[ScriptSource] {
        &self.sources
    }

    /// Hex SHA-256 over all sources
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Short fingerprint for log lines
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..12]
    }
}

#[cfg(test)]
pub(crate) fn fixture() -> ScriptPayload {
    ScriptPayload::with_library(
        "federation_fixture.js",
        include_str!("../testdata/federation_fixture.js"),
    )
}
