use crate::read_string;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_LMSTUDIO_URL: &str = "http://localhost:1234";
const DEFAULT_VLLM_URL: &str = "http://localhost:8000";
const DEFAULT_MLX_URL: &str = "http://localhost:8080";

/// Base URLs of local OpenAI-compatible inference servers.
///
/// Each URL can be overridden through its environment variable; Ollama
/// additionally honours the conventional `OLLAMA_HOST`.
#[derive(Debug, Clone)]
pub struct LocalEndpoints {
    /// Ollama server (`OLLAMA_BASE_URL`, falling back to `OLLAMA_HOST`).
    pub ollama: String,
    /// LM Studio server (`LMSTUDIO_BASE_URL`).
    pub lmstudio: String,
    /// vLLM server (`VLLM_BASE_URL`).
    pub vllm: String,
    /// MLX server (`MLX_BASE_URL`).
    pub mlx: String,
}

impl Default for LocalEndpoints {
    fn default() -> Self {
        Self {
            ollama: DEFAULT_OLLAMA_URL.to_string(),
            lmstudio: DEFAULT_LMSTUDIO_URL.to_string(),
            vllm: DEFAULT_VLLM_URL.to_string(),
            mlx: DEFAULT_MLX_URL.to_string(),
        }
    }
}

impl LocalEndpoints {
    pub(crate) fn from_env() -> Self {
        let ollama = read_string("OLLAMA_BASE_URL")
            .or_else(|| read_string("OLLAMA_HOST").map(normalize_host))
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Self {
            ollama: trim_trailing_slash(ollama),
            lmstudio: trim_trailing_slash(
                read_string("LMSTUDIO_BASE_URL").unwrap_or_else(|| DEFAULT_LMSTUDIO_URL.to_string()),
            ),
            vllm: trim_trailing_slash(read_string("VLLM_BASE_URL").unwrap_or_else(|| DEFAULT_VLLM_URL.to_string())),
            mlx: trim_trailing_slash(read_string("MLX_BASE_URL").unwrap_or_else(|| DEFAULT_MLX_URL.to_string())),
        }
    }
}

/// `OLLAMA_HOST` may be a bare `host:port` without a scheme.
fn normalize_host(host: String) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host
    } else {
        format!("http://{host}")
    }
}

fn trim_trailing_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
