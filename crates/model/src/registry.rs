//! Architecture registry: maps names like `resnet32` to constructors.

use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Result};
use thiserror::Error;

use crate::{
    resnet::{ResNet, ResNetConfig},
    ImageClassifier,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    ResNet20,
    ResNet32,
    ResNet44,
    ResNet56,
    ResNet110,
    ResNet1202,
}

#[derive(Debug, Clone, Error)]
#[error("unknown architecture '{name}' (expected one of: {})", Architecture::names().join(", "))]
pub struct UnknownArchitecture {
    pub name: String,
}

/// Construction parameters shared by every architecture.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            num_classes: 10,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }
}

impl Architecture {
    pub const ALL: [Architecture; 6] = [
        Architecture::ResNet20,
        Architecture::ResNet32,
        Architecture::ResNet44,
        Architecture::ResNet56,
        Architecture::ResNet110,
        Architecture::ResNet1202,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Architecture::ResNet20 => "resnet20",
            Architecture::ResNet32 => "resnet32",
            Architecture::ResNet44 => "resnet44",
            Architecture::ResNet56 => "resnet56",
            Architecture::ResNet110 => "resnet110",
            Architecture::ResNet1202 => "resnet1202",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|arch| arch.name()).collect()
    }

    pub fn depth(self) -> usize {
        match self {
            Architecture::ResNet20 => 20,
            Architecture::ResNet32 => 32,
            Architecture::ResNet44 => 44,
            Architecture::ResNet56 => 56,
            Architecture::ResNet110 => 110,
            Architecture::ResNet1202 => 1202,
        }
    }

    /// The deepest variants do not converge from the full learning rate and
    /// spend their first epoch at a tenth of it.
    pub fn needs_lr_warmup(self) -> bool {
        matches!(self, Architecture::ResNet110 | Architecture::ResNet1202)
    }

    pub fn build(self, spec: &BuildSpec) -> Result<Box<dyn ImageClassifier>> {
        let config = ResNetConfig::with_depth(
            self.name(),
            self.depth(),
            spec.num_classes,
            spec.dtype,
            spec.device.clone(),
        )?;
        Ok(Box::new(ResNet::new(config)?))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = UnknownArchitecture;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|arch| arch.name() == wanted)
            .ok_or_else(|| UnknownArchitecture {
                name: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
        assert_eq!(" ResNet56 ".parse::<Architecture>().unwrap(), Architecture::ResNet56);
    }

    #[test]
    fn unknown_name_lists_known_architectures() {
        let err = "resnet18".parse::<Architecture>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("resnet18"));
        assert!(message.contains("resnet1202"));
    }

    #[test]
    fn warmup_only_for_deep_variants() {
        let warm: Vec<_> = Architecture::ALL
            .into_iter()
            .filter(|arch| arch.needs_lr_warmup())
            .collect();
        assert_eq!(warm, vec![Architecture::ResNet110, Architecture::ResNet1202]);
    }
}
