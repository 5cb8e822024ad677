//! Origin normalization and filtering

use url::{Origin, Url};

use crate::utils::{BridgeError, Result};

/// Reduce a URL or origin string to `scheme://host[:port]`.
///
/// Special schemes use the standard ASCII serialization. Non-special schemes
/// (for example `chrome://panel`) have opaque origins in the URL standard, so
/// they keep their scheme and host instead.
pub fn normalize_origin(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).map_err(|e| BridgeError::InvalidOrigin(format!("{}: {}", raw, e)))?;

    match url.origin() {
        origin @ Origin::Tuple(..) => Ok(origin.ascii_serialization()),
        Origin::Opaque(_) => {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| BridgeError::InvalidOrigin(format!("{}: no host", raw)))?;
            match url.port() {
                Some(port) => Ok(format!("{}://{}:{}", url.scheme(), host, port)),
                None => Ok(format!("{}://{}", url.scheme(), host)),
            }
        }
    }
}

/// Accepts messages only from one expected origin
#[derive(Debug, Clone)]
pub struct OriginFilter {
    expected: String,
}

impl OriginFilter {
    pub fn new(expected: &str) -> Result<Self> {
        Ok(Self {
            expected: normalize_origin(expected)?,
        })
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// Check an inbound origin; unparsable origins never match
    pub fn matches(&self, origin: &str) -> bool {
        normalize_origin(origin)
            .map(|o| o == self.expected)
            .unwrap_or(false)
    }
}
