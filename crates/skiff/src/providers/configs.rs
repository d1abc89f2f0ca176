pub const DEFAULT_HOST: &str = "https://api.minimax.io/anthropic";
pub const DEFAULT_MODEL: &str = "MiniMax-M2";
pub const DEFAULT_MAX_TOKENS: u32 = 16384;

/// Settings for an Anthropic-compatible messages endpoint
#[derive(Debug, Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl AnthropicProviderConfig {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}
