//! Voice catalog
//!
//! Resolves a client-supplied voice identifier to the backend family that
//! can speak it. Registration and persistence of cloned voices live
//! elsewhere; the gateway only needs lookup.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Which backend family a voice requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    /// Pretrained voice baked into the base model
    Preset,
    /// Zero-shot cloned voice referencing stored speaker state
    Cloned,
}

#[derive(Debug, Default)]
pub struct VoiceCatalog {
    voices: RwLock<HashMap<String, BackendFamily>>,
}

impl VoiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_presets<I, S>(presets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let voices = presets
            .into_iter()
            .map(|v| (v.into(), BackendFamily::Preset))
            .collect();
        Self {
            voices: RwLock::new(voices),
        }
    }

    pub fn insert_cloned(&self, voice: impl Into<String>) {
        self.voices.write().insert(voice.into(), BackendFamily::Cloned);
    }

    /// None means the voice is unknown and start must be rejected.
    pub fn resolve(&self, voice: &str) -> Option<BackendFamily> {
        self.voices.read().get(voice).copied()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.voices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.voices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.read().is_empty()
    }
}
