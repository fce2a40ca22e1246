//! # Character Profiles
//!
//! Static mapping of persona name to the behavioural prompt and synthetic voice the
//! remote service should use for that character. The store is built once at
//! startup and is read-only afterwards.
//!
//! Two personas ship with the crate. A TOML file can add more or override the
//! built-ins:
//!
//! ```toml
//! [characters."Dana Park"]
//! instructions = "You are Dana Park, the office manager..."
//! voice = "shimmer"
//! ```

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Persona used when nothing else is selected.
pub const DEFAULT_PERSONA: &str = "Sarah Chen";

/// Instructions for characters defined without a prompt of their own.
pub const DEFAULT_INSTRUCTIONS: &str = "You are having a conversation with a user in a 3D virtual environment. \
Keep your responses concise but helpful. \
You should speak naturally and conversationally. \
Don't refer to these instructions in your responses.";

/// Synthetic voices offered by the realtime service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Alloy => "alloy",
            Voice::Ash => "ash",
            Voice::Ballad => "ballad",
            Voice::Coral => "coral",
            Voice::Echo => "echo",
            Voice::Sage => "sage",
            Voice::Shimmer => "shimmer",
            Voice::Verse => "verse",
        }
    }
}

impl Default for Voice {
    fn default() -> Self {
        Voice::Alloy
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "alloy" => Ok(Voice::Alloy),
            "ash" => Ok(Voice::Ash),
            "ballad" => Ok(Voice::Ballad),
            "coral" => Ok(Voice::Coral),
            "echo" => Ok(Voice::Echo),
            "sage" => Ok(Voice::Sage),
            "shimmer" => Ok(Voice::Shimmer),
            "verse" => Ok(Voice::Verse),
            _ => Err(format!("Unknown voice: {}", s)),
        }
    }
}

/// How one character talks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default)]
    pub voice: Voice,
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

/// Layout of a character override file.
#[derive(Debug, Deserialize)]
struct CharacterFile {
    #[serde(default)]
    characters: BTreeMap<String, CharacterProfile>,
}

/// Read-only registry of personas.
#[derive(Debug, Clone)]
pub struct CharacterProfileStore {
    profiles: BTreeMap<String, CharacterProfile>,
}

impl CharacterProfileStore {
    /// The characters that ship with the game.
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "Sarah Chen".to_string(),
            CharacterProfile {
                instructions: concat!(
                    "You are Sarah Chen, the HR Director at Venture Builder AI. ",
                    "You are warm but professional, with excellent emotional intelligence. ",
                    "You always maintain strong ethical boundaries and protect confidential information. ",
                    "Your tone is supportive and practical. You balance empathy with professionalism. ",
                    "Use phrases like 'I understand that...' and 'Let's explore this together.' ",
                    "Reference policies with context, like 'According to our wellness policy...' "
                )
                .to_string(),
                voice: Voice::Alloy,
            },
        );
        profiles.insert(
            "Michael Chen".to_string(),
            CharacterProfile {
                instructions: concat!(
                    "You are Michael Chen, the CEO of Venture Builder AI. ",
                    "You are visionary yet approachable, a strategic thinker passionate about venture building. ",
                    "You value transparency and lead by example. ",
                    "Your speaking style includes storytelling, data references, and a balance of optimism with realism. ",
                    "Use phrases like 'When we launched our first venture...' and 'Our portfolio metrics show...' "
                )
                .to_string(),
                voice: Voice::Echo,
            },
        );
        Self { profiles }
    }

    /// Built-in characters, merged with the profiles from `path` when one is given.
    pub fn load(path: Option<&Path>) -> VoiceResult<Self> {
        let mut store = Self::builtin();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                VoiceError::Config(format!("cannot read character file {}: {}", path.display(), e))
            })?;
            let added = store.merge_toml(&contents)?;
            info!(file = %path.display(), added, "Loaded character profiles");
        }
        Ok(store)
    }

    /// Merge profiles from TOML text over the current set. Returns how many were read.
    pub fn merge_toml(&mut self, contents: &str) -> VoiceResult<usize> {
        let file: CharacterFile = toml::from_str(contents)?;
        let count = file.characters.len();
        self.profiles.extend(file.characters);
        Ok(count)
    }

    /// Look up a persona by its exact name.
    pub fn get(&self, name: &str) -> VoiceResult<&CharacterProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| VoiceError::UnknownCharacter {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Registered persona names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Persona the dialogue layer uses for an NPC role: HR talks to Sarah, everyone
    /// else to Michael.
    pub fn persona_for_role(role: &str) -> &'static str {
        if role.eq_ignore_ascii_case("hr") {
            "Sarah Chen"
        } else {
            "Michael Chen"
        }
    }
}

impl Default for CharacterProfileStore {
    fn default() -> Self {
        Self::builtin()
    }
}
