/// Configuration for a [`ContextTree`](crate::ContextTree).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use mbus_transport::TreeConfig;
///
/// let config = TreeConfig::new()
///     .max_message_size(64 * 1024)
///     .max_depth(8);
/// ```
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Maximum size of a posted value, measured on its JSON encoding.
    pub(crate) max_message_size: usize,
    /// Maximum nesting depth for child contexts (a root is depth 0).
    pub(crate) max_depth: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1 MB
            max_depth: 16,
        }
    }

    /// Set maximum posted message size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set maximum nesting depth (default: 16).
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}
