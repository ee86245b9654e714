use crate::error::ModelResult;
use serde::{Deserialize, Serialize};
use std::fs;

/// Tolerance and violation mode used when checking feasibility
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityConfig {
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default = "default_relative")]
    pub relative: bool,
}

fn default_relative() -> bool {
    true
}

impl Default for FeasibilityConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.0,
            relative: true,
        }
    }
}

/// Per-block configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default)]
    pub is_feasible: Option<FeasibilityConfig>,
}

impl BlockConfig {
    /// Picks the explicit configuration if given, then the one stored in
    /// the block, then the default `{ tolerance: 0, relative }`.
    pub fn resolve_feasibility(
        explicit: Option<&FeasibilityConfig>,
        block: Option<&BlockConfig>,
    ) -> FeasibilityConfig {
        explicit
            .copied()
            .or_else(|| block.and_then(|c| c.is_feasible))
            .unwrap_or_default()
    }
}

pub fn read_block_config(filepath: &str) -> ModelResult<BlockConfig> {
    let contents = fs::read_to_string(filepath)?;
    let parsed: BlockConfig = serde_json::from_str(&contents)?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_feasibility() {
        let cfg = BlockConfig::resolve_feasibility(None, None);
        assert_eq!(cfg.tolerance, 0.0);
        assert!(cfg.relative);
    }

    #[test]
    fn test_explicit_overrides_block() {
        let block = BlockConfig {
            is_feasible: Some(FeasibilityConfig {
                tolerance: 1e-3,
                relative: false,
            }),
        };
        let explicit = FeasibilityConfig {
            tolerance: 1e-6,
            relative: true,
        };
        let cfg = BlockConfig::resolve_feasibility(Some(&explicit), Some(&block));
        assert_eq!(cfg, explicit);
        let cfg = BlockConfig::resolve_feasibility(None, Some(&block));
        assert_eq!(cfg.tolerance, 1e-3);
        assert!(!cfg.relative);
    }

    #[test]
    fn test_read_block_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{ "is_feasible": {{ "tolerance": 0.01 }} }}"#).unwrap();
        let config = read_block_config(path.to_str().unwrap()).unwrap();
        let feasibility = config.is_feasible.unwrap();
        assert_eq!(feasibility.tolerance, 0.01);
        assert!(feasibility.relative);
    }

    #[test]
    fn test_read_missing_config_fails() {
        assert!(read_block_config("does/not/exist.json").is_err());
    }
}
