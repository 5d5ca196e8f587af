//! Payload metadata.

/// Describes any payload travelling over the session: an auxiliary
/// resource, the main document, or a result unit. Immutable once emitted.
///
/// On the wire the optional fields encode as an empty string (mime type,
/// encoding) or `-1` (length).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSource {
    /// Virtual URI identifying the payload.
    pub uri: String,
    /// MIME type, if known.
    pub mime_type: Option<String>,
    /// Character encoding, if known and applicable.
    pub encoding: Option<String>,
    /// Payload length in bytes, if known up front.
    pub length: Option<u64>,
}

impl MetaSource {
    pub fn new(
        uri: impl Into<String>,
        mime_type: Option<String>,
        encoding: Option<String>,
        length: Option<u64>,
    ) -> Self {
        Self {
            uri: uri.into(),
            mime_type,
            encoding,
            length,
        }
    }

    /// Metadata carrying only a URI.
    pub fn uri_only(uri: impl Into<String>) -> Self {
        Self::new(uri, None, None, None)
    }
}
