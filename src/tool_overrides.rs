//! Resolution of external executables: explicit override, then environment
//! variable, then a `PATH` lookup of the default binary name.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{LazyLock, RwLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalTool {
    Fastp,
    Bwa,
    Bowtie2,
    Bowtie2Build,
    Samtools,
    Bcftools,
    Raxml,
}

impl ExternalTool {
    pub const ALL: [ExternalTool; 7] = [
        ExternalTool::Fastp,
        ExternalTool::Bwa,
        ExternalTool::Bowtie2,
        ExternalTool::Bowtie2Build,
        ExternalTool::Samtools,
        ExternalTool::Bcftools,
        ExternalTool::Raxml,
    ];

    pub fn env_var(&self) -> &'static str {
        match self {
            ExternalTool::Fastp => "SNPGENIE_FASTP",
            ExternalTool::Bwa => "SNPGENIE_BWA",
            ExternalTool::Bowtie2 => "SNPGENIE_BOWTIE2",
            ExternalTool::Bowtie2Build => "SNPGENIE_BOWTIE2_BUILD",
            ExternalTool::Samtools => "SNPGENIE_SAMTOOLS",
            ExternalTool::Bcftools => "SNPGENIE_BCFTOOLS",
            ExternalTool::Raxml => "SNPGENIE_RAXML",
        }
    }

    pub fn default_bin(&self) -> &'static str {
        match self {
            ExternalTool::Fastp => "fastp",
            ExternalTool::Bwa => "bwa",
            ExternalTool::Bowtie2 => "bowtie2",
            ExternalTool::Bowtie2Build => "bowtie2-build",
            ExternalTool::Samtools => "samtools",
            ExternalTool::Bcftools => "bcftools",
            ExternalTool::Raxml => "raxmlHPC-PTHREADS",
        }
    }

    pub fn executable(&self) -> String {
        resolve_tool_executable(self.env_var(), self.default_bin())
    }
}

static TOOL_OVERRIDES: LazyLock<RwLock<HashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// An empty value removes the override.
pub fn set_tool_override(env_var: &str, configured: &str) {
    let mut guard = match TOOL_OVERRIDES.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(value) = normalized_non_empty(configured) {
        guard.insert(env_var.to_string(), value);
    } else {
        guard.remove(env_var);
    }
}

/// Installs every entry of a settings `tools` table.
pub fn apply_tool_overrides(tools: &BTreeMap<String, String>) {
    for (env_var, configured) in tools {
        set_tool_override(env_var, configured);
    }
}

pub fn get_tool_override(env_var: &str) -> Option<String> {
    let guard = match TOOL_OVERRIDES.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get(env_var).cloned()
}

fn configured_or_env(env_var: &str) -> Option<String> {
    get_tool_override(env_var).or_else(|| {
        std::env::var(env_var)
            .ok()
            .and_then(|v| normalized_non_empty(&v))
    })
}

pub fn resolve_tool_executable(env_var: &str, default_bin: &str) -> String {
    configured_or_env(env_var).unwrap_or_else(|| default_bin.to_string())
}

pub fn active_resolution_label(env_var: &str, default_bin: &str) -> String {
    configured_or_env(env_var).unwrap_or_else(|| format!("PATH lookup: {default_bin}"))
}

/// One line per known tool, for the CLI `tools` command.
pub fn resolution_table() -> Vec<(String, String)> {
    ExternalTool::ALL
        .iter()
        .map(|tool| {
            (
                tool.default_bin().to_string(),
                active_resolution_label(tool.env_var(), tool.default_bin()),
            )
        })
        .collect()
}
