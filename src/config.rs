//! Ring attention configuration types.
//!
//! [`RingAttentionConfig`] is the per-engine configuration (which transport
//! strategy, how many KV heads per gathered window). [`AttentionParams`] are the
//! per-call attention hyperparameters; they are resolved against the kernel's
//! [`KernelAbi`] into the fixed [`KernelParams`] record the kernel receives.

use crate::error::{Error, Result};
use crate::ops::traits::{KernelAbi, KernelParams};
use serde::{Deserialize, Serialize};

/// How key/value shards move between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommStrategy {
    /// Gather one KV head-group window from every rank per step; backward
    /// folds gradients with a reduce-scatter per window.
    #[default]
    HeadWindowAllGather,
    /// Rotate full KV shards around the ring with paired send/recv and merge
    /// partial outputs with the online softmax.
    RotatingRing,
}

/// Ring attention engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RingAttentionConfig {
    #[serde(default)]
    pub strategy: CommStrategy,

    /// KV heads per gathered window. `None` gathers all heads at once.
    #[serde(default)]
    pub heads_k_stride: Option<usize>,

    /// Kernel ABI version this integration was built against. When set, the
    /// engine refuses kernels reporting a different version.
    #[serde(default)]
    pub kernel_abi_version: Option<u32>,
}

impl RingAttentionConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| Error::ConfigError {
            reason: format!("failed to parse ring attention config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heads_k_stride == Some(0) {
            return Err(Error::ConfigError {
                reason: "heads_k_stride must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Window width for a model with `num_kv_heads` KV heads.
    pub fn heads_k_stride_for(&self, num_kv_heads: usize) -> Result<usize> {
        let stride = self.heads_k_stride.unwrap_or(num_kv_heads);
        if stride == 0 || num_kv_heads % stride != 0 {
            return Err(Error::InvalidArgument {
                arg: "heads_k_stride",
                reason: format!(
                    "num_kv_heads ({num_kv_heads}) must be divisible by heads_k_stride ({stride})"
                ),
            });
        }
        Ok(stride)
    }

    /// Reject a kernel built for a different ABI than this config expects.
    pub fn check_kernel_abi(&self, abi: &KernelAbi) -> Result<()> {
        match self.kernel_abi_version {
            Some(expected) if expected != abi.version => Err(Error::ConfigError {
                reason: format!(
                    "kernel ABI version {} does not match configured version {expected}",
                    abi.version
                ),
            }),
            _ => Ok(()),
        }
    }
}

/// Per-call attention hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionParams {
    /// Defaults to `1/sqrt(head_dim)`.
    #[serde(default)]
    pub softmax_scale: Option<f64>,

    #[serde(default)]
    pub dropout_p: f64,

    #[serde(default)]
    pub causal: bool,

    /// `(left, right)`; -1 means unbounded on that side.
    #[serde(default = "default_window_size")]
    pub window_size: (isize, isize),

    /// Per-head ALiBi slopes. Not supported by the ring engine; supplying any
    /// is rejected.
    #[serde(default)]
    pub alibi_slopes: Option<Vec<f32>>,

    #[serde(default)]
    pub deterministic: bool,
}

fn default_window_size() -> (isize, isize) {
    (-1, -1)
}

impl Default for AttentionParams {
    fn default() -> Self {
        Self {
            softmax_scale: None,
            dropout_p: 0.0,
            causal: false,
            window_size: default_window_size(),
            alibi_slopes: None,
            deterministic: false,
        }
    }
}

impl AttentionParams {
    pub fn causal() -> Self {
        Self {
            causal: true,
            ..Self::default()
        }
    }

    pub fn has_sliding_window(&self) -> bool {
        self.window_size.0 >= 0 || self.window_size.1 >= 0
    }

    /// Validate against what the kernel accepts and fill in defaults.
    pub fn resolve(&self, head_dim: usize, abi: &KernelAbi) -> Result<KernelParams> {
        if self.alibi_slopes.is_some() {
            return Err(Error::InvalidArgument {
                arg: "alibi_slopes",
                reason: "per-position attention bias is not supported by ring attention".into(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(Error::InvalidArgument {
                arg: "dropout_p",
                reason: format!("must be in [0, 1), got {}", self.dropout_p),
            });
        }
        if self.dropout_p > 0.0 && !abi.dropout {
            return Err(Error::InvalidArgument {
                arg: "dropout_p",
                reason: format!("kernel ABI v{} does not support dropout", abi.version),
            });
        }
        if self.has_sliding_window() && !abi.sliding_window {
            return Err(Error::InvalidArgument {
                arg: "window_size",
                reason: format!("kernel ABI v{} does not support sliding windows", abi.version),
            });
        }
        if self.window_size.0 < -1 || self.window_size.1 < -1 {
            return Err(Error::InvalidArgument {
                arg: "window_size",
                reason: format!("bounds must be >= -1, got {:?}", self.window_size),
            });
        }
        if self.deterministic && !abi.deterministic_backward {
            return Err(Error::InvalidArgument {
                arg: "deterministic",
                reason: format!(
                    "kernel ABI v{} has no deterministic backward",
                    abi.version
                ),
            });
        }
        let softmax_scale = match self.softmax_scale {
            Some(s) if !(s.is_finite() && s > 0.0) => {
                return Err(Error::InvalidArgument {
                    arg: "softmax_scale",
                    reason: format!("must be finite and positive, got {s}"),
                });
            }
            Some(s) => s,
            None => (head_dim as f64).sqrt().recip(),
        };

        Ok(KernelParams {
            softmax_scale,
            dropout_p: self.dropout_p,
            causal: self.causal,
            window_size: self.window_size,
            deterministic: self.deterministic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
strategy: rotating_ring
heads_k_stride: 2
kernel_abi_version: 1
"#;
        let config = RingAttentionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.strategy, CommStrategy::RotatingRing);
        assert_eq!(config.heads_k_stride, Some(2));
        assert_eq!(config.heads_k_stride_for(8).unwrap(), 2);
        assert!(config.heads_k_stride_for(3).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = RingAttentionConfig::from_yaml("{}").unwrap();
        assert_eq!(config.strategy, CommStrategy::HeadWindowAllGather);
        assert_eq!(config.heads_k_stride_for(4).unwrap(), 4);
    }

    #[test]
    fn test_config_rejects_zero_stride() {
        let err = RingAttentionConfig::from_yaml("heads_k_stride: 0").unwrap_err();
        assert!(matches!(err, Error::ConfigError { .. }));
    }

    #[test]
    fn test_kernel_abi_version_check() {
        let config = RingAttentionConfig {
            kernel_abi_version: Some(KernelAbi::CPU_REFERENCE.version + 1),
            ..Default::default()
        };
        assert!(config.check_kernel_abi(&KernelAbi::CPU_REFERENCE).is_err());
        assert!(
            RingAttentionConfig::default()
                .check_kernel_abi(&KernelAbi::CPU_REFERENCE)
                .is_ok()
        );
    }

    #[test]
    fn test_params_default_scale() {
        let p = AttentionParams::causal()
            .resolve(64, &KernelAbi::CPU_REFERENCE)
            .unwrap();
        assert!((p.softmax_scale - 0.125).abs() < 1e-12);
        assert!(p.causal);
    }

    #[test]
    fn test_params_reject_alibi_and_dropout() {
        let abi = KernelAbi::CPU_REFERENCE;
        let alibi = AttentionParams {
            alibi_slopes: Some(vec![0.5]),
            ..Default::default()
        };
        assert!(matches!(
            alibi.resolve(8, &abi),
            Err(Error::InvalidArgument { arg: "alibi_slopes", .. })
        ));

        let dropout = AttentionParams {
            dropout_p: 0.1,
            ..Default::default()
        };
        assert!(matches!(
            dropout.resolve(8, &abi),
            Err(Error::InvalidArgument { arg: "dropout_p", .. })
        ));
    }

    #[test]
    fn test_params_from_yaml() {
        let p: AttentionParams = serde_yaml::from_str("causal: true\nwindow_size: [4, 0]").unwrap();
        assert!(p.causal);
        assert_eq!(p.window_size, (4, 0));
        assert!(p.has_sliding_window());
    }
}
