//! Model catalog: references, format detection and the built-in entries.

pub mod format;
mod model_ref;

pub use format::{DetectedFormat, FormatDetector, DEFAULT_LARGE_MODEL_BYTES};
pub use model_ref::{validate_model_id, InvalidModelId, ModelRef, DEFAULT_REVISION};

/// A selectable catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub repository: &'static str,
    pub filename: Option<&'static str>,
    pub size_bytes: u64,
}

impl CatalogEntry {
    /// Build the immutable reference used by the pipeline.
    pub fn to_model_ref(&self) -> Result<ModelRef, InvalidModelId> {
        let mut model = ModelRef::new(self.id, self.repository)?.with_declared_size(self.size_bytes);
        if let Some(filename) = self.filename {
            model = model.with_filename(filename);
        }
        Ok(model)
    }
}

const BUILTIN: &[CatalogEntry] = &[
    CatalogEntry {
        id: "gpt2",
        name: "GPT-2 (124M)",
        repository: "openai-community/gpt2",
        filename: Some("model.safetensors"),
        size_bytes: 548_105_171,
    },
    CatalogEntry {
        id: "qwen2.5-0.5b-instruct",
        name: "Qwen2.5 0.5B Instruct",
        repository: "Qwen/Qwen2.5-0.5B-Instruct",
        filename: Some("model.safetensors"),
        size_bytes: 988_097_824,
    },
    CatalogEntry {
        id: "qwen2.5-7b-instruct",
        name: "Qwen2.5 7B Instruct",
        repository: "Qwen/Qwen2.5-7B-Instruct",
        filename: None,
        size_bytes: 15_231_271_864,
    },
    CatalogEntry {
        id: "llama-3.2-1b-instruct-4bit",
        name: "Llama 3.2 1B Instruct (MLX 4-bit)",
        repository: "mlx-community/Llama-3.2-1B-Instruct-4bit",
        filename: Some("model.safetensors"),
        size_bytes: 695_283_921,
    },
    CatalogEntry {
        id: "tinyllama-1.1b-chat-q4_k_m",
        name: "TinyLlama 1.1B Chat (Q4_K_M)",
        repository: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
        filename: Some("tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf"),
        size_bytes: 668_788_096,
    },
];

/// Entries shipped with the binary.
pub fn builtin() -> &'static [CatalogEntry] {
    BUILTIN
}

/// Look up a built-in entry by id.
pub fn find(id: &str) -> Option<&'static CatalogEntry> {
    BUILTIN.iter().find(|e| e.id == id)
}
