// src/server/backend.rs

use crate::config::ServeConfig;
use crate::errors::{HarnessError, Result};

/// Serving engines the harness knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Vllm,
    Sglang,
}

impl Backend {
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "vllm" => Ok(Backend::Vllm),
            "sglang" => Ok(Backend::Sglang),
            other => Err(HarnessError::UnsupportedBackend(other.to_string())),
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Sglang => "sglang",
        }
    }

    /// The configured entrypoint for this backend, before any flags.
    pub fn command_template<'a>(&self, config: &'a ServeConfig) -> &'a [String] {
        match self {
            Backend::Vllm => &config.vllm_command,
            Backend::Sglang => &config.sglang_command,
        }
    }

    /// Tuning flags exported to the server process.
    pub fn tuning_env(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Backend::Vllm => &[
                ("VLLM_USE_V1", "1"),
                ("VLLM_ROCM_USE_AITER", "1"),
                ("VLLM_ROCM_USE_AITER_MHA", "0"),
                ("VLLM_V1_USE_PREFILL_DECODE_ATTENTION", "1"),
                ("SAFETENSORS_FAST_GPU", "1"),
            ],
            Backend::Sglang => &[("SGLANG_USE_AITER", "1")],
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
