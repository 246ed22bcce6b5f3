use skein_core::config::ModelConfig;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// A named provider preset for OpenAI-compatible APIs.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
}

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "openai" => Some(ProviderPreset {
            default_base_url: OPENAI_API_URL,
            needs_api_key: true,
        }),
        "ollama" => Some(ProviderPreset {
            default_base_url: "http://localhost:11434/v1/chat/completions",
            needs_api_key: false,
        }),
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1/chat/completions",
            needs_api_key: true,
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1/chat/completions",
            needs_api_key: true,
        }),
        "together" => Some(ProviderPreset {
            default_base_url: "https://api.together.xyz/v1/chat/completions",
            needs_api_key: true,
        }),
        "mistral" => Some(ProviderPreset {
            default_base_url: "https://api.mistral.ai/v1/chat/completions",
            needs_api_key: true,
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1/chat/completions",
            needs_api_key: true,
        }),
        _ => None,
    }
}

/// Endpoint for a model: explicit `base_url`, else the provider preset,
/// else OpenAI.
pub fn resolve_endpoint(config: &ModelConfig) -> String {
    if let Some(ref url) = config.base_url {
        return url.clone();
    }
    get_preset(&config.provider)
        .map(|p| p.default_base_url)
        .unwrap_or(OPENAI_API_URL)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, base_url: Option<&str>) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            model_id: "m".into(),
            api_key: None,
            base_url: base_url.map(String::from),
            max_tokens: 256,
            temperature: 0.0,
            retry: None,
        }
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(
            resolve_endpoint(&config("ollama", None)),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(resolve_endpoint(&config("unknown", None)), OPENAI_API_URL);
        assert_eq!(
            resolve_endpoint(&config("groq", Some("http://proxy/v1/chat/completions"))),
            "http://proxy/v1/chat/completions"
        );
    }

    #[test]
    fn test_local_presets_skip_key() {
        assert!(!get_preset("ollama").unwrap().needs_api_key);
        assert!(get_preset("openai").unwrap().needs_api_key);
    }
}
