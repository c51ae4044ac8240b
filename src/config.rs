use crate::header::Headers;

/// Upper bound on queued messages per WebSocket client.
pub const WS_MAX_QUEUED_MESSAGES: usize = 4;
/// Default client limit used by `WebSocketServer::cleanup_clients`.
pub const DEFAULT_MAX_WS_CLIENTS: usize = 4;
/// Upper bound on queued events per SSE client.
pub const SSE_MAX_QUEUED_MESSAGES: usize = 32;
/// Delimiter of template placeholders, `%NAME%`.
pub const TEMPLATE_PLACEHOLDER: u8 = b'%';
/// Longest placeholder name looked for between two delimiters.
pub const TEMPLATE_PARAM_NAME_LENGTH: usize = 32;

/// Server wide limits and defaults.
///
/// ```
/// use asyncweb::config::ServerConfig;
///
/// let mut config = ServerConfig::default();
/// config.max_content_length = 16 * 1024;
/// config.default_headers.add("Access-Control-Allow-Origin", "*");
/// ```
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Largest accepted request line plus header block, in bytes.  Connections sending more are
    /// closed.
    ///
    /// Default: 4096
    pub max_header_size: usize,

    /// Largest accepted request body.  Requests declaring (or streaming) more are answered with
    /// `413` and closed.
    ///
    /// Default: 1 MiB
    pub max_content_length: usize,

    /// Largest value kept for a single url-encoded or multipart form field.  Longer values are
    /// truncated.
    ///
    /// Default: 1024
    pub max_form_field_size: usize,

    /// Headers added to every response that does not already carry a header of the same name.
    pub default_headers: Headers,

    /// Seed of the pseudo random generator used for digest nonces and frame masks.  Seed it from
    /// a hardware RNG on real devices.
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_header_size: 4096,
            max_content_length: 1024 * 1024,
            max_form_field_size: 1024,
            default_headers: Headers::new(),
            seed: 0x5EED_CAFE,
        }
    }
}
