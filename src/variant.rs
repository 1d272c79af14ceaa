//! Supported model variants and their sampling defaults.

use crate::error::{Error, Result};

/// The model family members this pipeline knows how to drive.
///
/// The guidance-distilled `Dev` variant benefits from a resolution-shifted
/// timestep schedule; the few-step `Schnell` variant samples on a uniform one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Dev,
    Schnell,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Dev, ModelVariant::Schnell];

    /// Resolve a user-supplied model name, failing with the list of valid
    /// names for anything unrecognized.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "flux-dev" => Ok(ModelVariant::Dev),
            "flux-schnell" => Ok(ModelVariant::Schnell),
            _ => Err(Error::UnknownModelVariant {
                name: name.to_string(),
                known: Self::ALL
                    .iter()
                    .map(|v| v.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::Dev => "flux-dev",
            ModelVariant::Schnell => "flux-schnell",
        }
    }

    /// Whether the timestep schedule is reshaped by the token-count shift.
    pub fn shifted_schedule(&self) -> bool {
        !matches!(self, ModelVariant::Schnell)
    }

    pub fn default_steps(&self) -> usize {
        match self {
            ModelVariant::Dev => 30,
            ModelVariant::Schnell => 4,
        }
    }

    pub fn default_guidance(&self) -> f64 {
        match self {
            ModelVariant::Dev => 2.5,
            ModelVariant::Schnell => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for variant in ModelVariant::ALL {
            assert_eq!(ModelVariant::from_name(variant.name()).unwrap(), variant);
        }
    }

    #[test]
    fn unknown_name_lists_valid_ones() {
        let err = ModelVariant::from_name("flux-pro").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("flux-pro"));
        assert!(msg.contains("flux-dev"));
        assert!(msg.contains("flux-schnell"));
    }

    #[test]
    fn schnell_is_uniform() {
        assert!(ModelVariant::Dev.shifted_schedule());
        assert!(!ModelVariant::Schnell.shifted_schedule());
    }
}
