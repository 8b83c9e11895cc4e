use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::UsageMode;
use crate::config::{ReasoningKey, StreamConfig};
use crate::errors::StreamError;

/// Closed set of provider variants the stream layer knows how to consume.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    #[serde(rename = "azure_openai")]
    AzureOpenAi,
    Anthropic,
    Bedrock,
    Google,
    #[serde(rename = "vertexai")]
    VertexAi,
    Ollama,
    Mistral,
    DeepSeek,
    OpenRouter,
    Xai,
}

impl ProviderKind {
    /// Every built-in provider.
    pub const ALL: [ProviderKind; 11] = [
        ProviderKind::OpenAi,
        ProviderKind::AzureOpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Bedrock,
        ProviderKind::Google,
        ProviderKind::VertexAi,
        ProviderKind::Ollama,
        ProviderKind::Mistral,
        ProviderKind::DeepSeek,
        ProviderKind::OpenRouter,
        ProviderKind::Xai,
    ];

    /// Stable registry name (for example `openai`).
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::AzureOpenAi => "azure_openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Google => "google",
            ProviderKind::VertexAi => "vertexai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Mistral => "mistral",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Xai => "xai",
        }
    }

    /// Case-insensitive lookup by canonical name.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }

    /// Providers without stable per-call indices in their tool-call stream.
    pub fn manual_tool_stream(self) -> bool {
        matches!(
            self,
            ProviderKind::Anthropic | ProviderKind::Bedrock | ProviderKind::Ollama
        )
    }

    /// How this provider reports usage across chunks.
    pub fn usage_mode(self) -> UsageMode {
        match self {
            ProviderKind::Anthropic | ProviderKind::Bedrock => UsageMode::Incremental,
            _ => UsageMode::Cumulative,
        }
    }

    /// Field carrying reasoning text, when the provider fixes one.
    pub fn reasoning_key(self) -> Option<ReasoningKey> {
        match self {
            ProviderKind::DeepSeek => Some(ReasoningKey::ReasoningContent),
            ProviderKind::OpenRouter => Some(ReasoningKey::Reasoning),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider variant can do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub tool_calls: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tool_calls: true,
        }
    }
}

/// Stream-processing policy for one registered provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Registry name; defaults to the kind's name.
    pub name: String,
    pub kind: ProviderKind,
    pub capabilities: Capabilities,
    /// Buffer whole tool calls instead of streaming their fragments.
    pub manual_tool_stream: bool,
    pub usage_mode: UsageMode,
    pub reasoning_key: Option<ReasoningKey>,
}

impl ProviderProfile {
    /// Profile with the built-in policy for `kind`.
    pub fn for_kind(kind: ProviderKind) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            capabilities: Capabilities::default(),
            manual_tool_stream: kind.manual_tool_stream(),
            usage_mode: kind.usage_mode(),
            reasoning_key: kind.reasoning_key(),
        }
    }

    /// Registers the profile under a different name (for example a proxy).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Overrides the capability flags.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Overrides manual tool-call assembly.
    pub fn manual_tool_stream(mut self, manual: bool) -> Self {
        self.manual_tool_stream = manual;
        self
    }

    /// Overrides the usage mode.
    pub fn usage_mode(mut self, mode: UsageMode) -> Self {
        self.usage_mode = mode;
        self
    }

    /// Applies provider-fixed options on top of the caller's config.
    pub fn stream_config(&self, config: &StreamConfig) -> StreamConfig {
        let mut config = config.clone();
        if let Some(key) = self.reasoning_key {
            config.reasoning_key = key;
        }
        config
    }
}

/// Registry: provider name -> stream profile, validated when built.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    profiles: HashMap<String, ProviderProfile>,
}

impl ProviderRegistry {
    /// Empty builder.
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Registry with a profile for every known provider kind.
    pub fn with_builtins() -> Self {
        let profiles = ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str().to_string(), ProviderProfile::for_kind(kind)))
            .collect();
        Self { profiles }
    }

    /// Looks up a provider by name (case-insensitive).
    pub fn resolve(&self, name: &str) -> Result<&ProviderProfile, StreamError> {
        self.profiles
            .get(&name.trim().to_ascii_lowercase())
            .ok_or_else(|| StreamError::UnsupportedProvider {
                provider: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Collects provider profiles before building a [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    profiles: Vec<ProviderProfile>,
}

impl ProviderRegistryBuilder {
    /// Adds a profile; duplicates are rejected by `build`.
    pub fn register(mut self, profile: ProviderProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Registers the built-in profile for each given kind.
    pub fn register_kinds(mut self, kinds: impl IntoIterator<Item = ProviderKind>) -> Self {
        self.profiles
            .extend(kinds.into_iter().map(ProviderProfile::for_kind));
        self
    }

    /// Builds the registry, rejecting duplicate and empty names.
    pub fn build(self) -> Result<ProviderRegistry, StreamError> {
        let mut profiles = HashMap::new();
        let mut seen = HashSet::new();
        for mut profile in self.profiles {
            let name = profile.name.trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(StreamError::Config("provider name must not be empty".into()));
            }
            if !seen.insert(name.clone()) {
                return Err(StreamError::DuplicateProvider { provider: name });
            }
            profile.name = name.clone();
            profiles.insert(name, profile);
        }
        Ok(ProviderRegistry { profiles })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_fails_fast() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(
            registry.resolve("palm").unwrap_err(),
            StreamError::UnsupportedProvider {
                provider: "palm".into()
            }
        );
        assert_eq!(registry.resolve("OpenAI").unwrap().kind, ProviderKind::OpenAi);
    }

    #[test]
    fn build_rejects_duplicate_names() {
        let result = ProviderRegistry::builder()
            .register_kinds([ProviderKind::OpenAi])
            .register(ProviderProfile::for_kind(ProviderKind::Mistral).named("OpenAI"))
            .build();
        assert_eq!(
            result.unwrap_err(),
            StreamError::DuplicateProvider {
                provider: "openai".into()
            }
        );
    }

    #[test]
    fn builtin_policies() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.names().len(), ProviderKind::ALL.len());
        let anthropic = registry.resolve("anthropic").unwrap();
        assert!(anthropic.manual_tool_stream);
        assert_eq!(anthropic.usage_mode, UsageMode::Incremental);
        let openai = registry.resolve("openai").unwrap();
        assert!(!openai.manual_tool_stream);
        assert_eq!(openai.usage_mode, UsageMode::Cumulative);
    }

    #[test]
    fn profile_overrides_reasoning_key() {
        let base = StreamConfig::default();
        let deepseek = ProviderProfile::for_kind(ProviderKind::DeepSeek);
        assert_eq!(
            deepseek.stream_config(&base).reasoning_key,
            ReasoningKey::ReasoningContent
        );
        let openai = ProviderProfile::for_kind(ProviderKind::OpenAi);
        assert_eq!(openai.stream_config(&base), base);
    }

    #[test]
    fn kind_names_round_trip_through_parse() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("nope"), None);
    }
}
