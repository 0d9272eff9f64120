//! Typed mix parameters.
//!
//! A mix is described per stem by a gain and a suppression intensity. The
//! parameters are validated before rendering and hashed into a stable key
//! used to name rendered artifacts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::stem::StemKind;
use crate::{Error, Result};

/// Largest accepted linear gain (about +12 dB).
pub const MAX_LINEAR_GAIN: f32 = 4.0;

/// Largest accepted gain in decibels.
pub const MAX_GAIN_DB: f32 = 12.0;

/// Largest suppression intensity.
pub const MAX_SUPPRESSION: u8 = 100;

/// Upper bound of the percentage volume controls.
pub const MAX_VOLUME_PERCENT: f32 = 200.0;

/// Gain applied to a stem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "lowercase")]
pub enum Gain {
    Linear(f32),
    Decibels(f32),
}

impl Gain {
    pub const UNITY: Gain = Gain::Linear(1.0);
    pub const MUTE: Gain = Gain::Linear(0.0);

    /// Linear multiplier for this gain.
    pub fn to_linear(self) -> f32 {
        match self {
            Self::Linear(g) => g,
            Self::Decibels(db) => 10f32.powf(db / 20.0),
        }
    }

    fn validate(self, stem: StemKind) -> Result<()> {
        match self {
            Self::Linear(g) if !g.is_finite() || !(0.0..=MAX_LINEAR_GAIN).contains(&g) => {
                Err(Error::validation(format!(
                    "{} gain {} is outside 0..={}",
                    stem, g, MAX_LINEAR_GAIN
                )))
            }
            Self::Decibels(db) if !db.is_finite() || db > MAX_GAIN_DB => Err(Error::validation(
                format!("{} gain {} dB is above {} dB", stem, db, MAX_GAIN_DB),
            )),
            _ => Ok(()),
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Processing applied to one stem.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StemMix {
    #[serde(default)]
    pub gain: Gain,
    /// Noise/wind suppression intensity, 0 (off) to 100.
    #[serde(default)]
    pub suppression: u8,
}

impl StemMix {
    pub fn new(gain: Gain) -> Self {
        Self {
            gain,
            suppression: 0,
        }
    }

    pub fn with_suppression(mut self, intensity: u8) -> Self {
        self.suppression = intensity;
        self
    }
}

/// Mix parameters for the four stems.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MixParameters {
    #[serde(default)]
    pub vocals: StemMix,
    #[serde(default)]
    pub drums: StemMix,
    #[serde(default)]
    pub bass: StemMix,
    #[serde(default)]
    pub other: StemMix,
}

impl MixParameters {
    /// Unity gain on every stem, no suppression.
    pub fn unity() -> Self {
        Self::default()
    }

    /// Only `kind` at unity gain, every other stem muted.
    pub fn isolate(kind: StemKind) -> Self {
        let mut params = Self::default();
        for other in StemKind::ALL {
            if other != kind {
                params.stem_mut(other).gain = Gain::MUTE;
            }
        }
        params
    }

    /// Map the grouped volume controls onto stems.
    ///
    /// `voice` drives vocals, `music` drives drums and bass, `background`
    /// drives other. Volumes are percentages in `0..=200`. `wind` (0..=100)
    /// is applied as suppression on the background stem only.
    pub fn from_group_controls(voice: f32, music: f32, background: f32, wind: u8) -> Result<Self> {
        for (label, value) in [("voice", voice), ("music", music), ("background", background)] {
            if !value.is_finite() || !(0.0..=MAX_VOLUME_PERCENT).contains(&value) {
                return Err(Error::validation(format!(
                    "{} volume {} is outside 0..={}",
                    label, value, MAX_VOLUME_PERCENT
                )));
            }
        }
        let params = Self {
            vocals: StemMix::new(Gain::Linear(voice / 100.0)),
            drums: StemMix::new(Gain::Linear(music / 100.0)),
            bass: StemMix::new(Gain::Linear(music / 100.0)),
            other: StemMix::new(Gain::Linear(background / 100.0)).with_suppression(wind),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn stem(&self, kind: StemKind) -> &StemMix {
        match kind {
            StemKind::Vocals => &self.vocals,
            StemKind::Drums => &self.drums,
            StemKind::Bass => &self.bass,
            StemKind::Other => &self.other,
        }
    }

    pub fn stem_mut(&mut self, kind: StemKind) -> &mut StemMix {
        match kind {
            StemKind::Vocals => &mut self.vocals,
            StemKind::Drums => &mut self.drums,
            StemKind::Bass => &mut self.bass,
            StemKind::Other => &mut self.other,
        }
    }

    /// Set the gain of one stem.
    pub fn with_gain(mut self, kind: StemKind, gain: Gain) -> Self {
        self.stem_mut(kind).gain = gain;
        self
    }

    /// Set the suppression intensity of one stem.
    pub fn with_suppression(mut self, kind: StemKind, intensity: u8) -> Self {
        self.stem_mut(kind).suppression = intensity;
        self
    }

    /// Apply the same suppression intensity to every stem.
    pub fn with_global_suppression(mut self, intensity: u8) -> Self {
        for kind in StemKind::ALL {
            self.stem_mut(kind).suppression = intensity;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        for kind in StemKind::ALL {
            let stem = self.stem(kind);
            stem.gain.validate(kind)?;
            if stem.suppression > MAX_SUPPRESSION {
                return Err(Error::validation(format!(
                    "{} suppression {} is above {}",
                    kind, stem.suppression, MAX_SUPPRESSION
                )));
            }
        }
        Ok(())
    }

    /// Stable key identifying the rendered output of these parameters.
    ///
    /// Parameters that render identically (`Linear(1.0)` and `Decibels(0.0)`)
    /// share a key.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for kind in StemKind::ALL {
            let stem = self.stem(kind);
            hasher.update(kind.as_str().as_bytes());
            hasher.update(stem.gain.to_linear().to_bits().to_le_bytes());
            hasher.update([stem.suppression]);
        }
        let digest = hex::encode(hasher.finalize());
        digest[..16].to_string()
    }
}

/// What a rendered artifact is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixArtifactKind {
    Preview,
    Download,
}

/// A rendered mix inside a job directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixArtifact {
    pub kind: MixArtifactKind,
    /// Artifact name, resolvable through the controller's artifact lookup.
    pub name: String,
    pub path: PathBuf,
    pub params: MixParameters,
}
