/*
    playstate-rs | Dual-backend persistence for player sources and watch history.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Where a source's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SpotifyPlaylist,
    YoutubeChannel,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SpotifyPlaylist => "spotify_playlist",
            SourceKind::YoutubeChannel => "youtube_channel",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content category, used by the player to pick announcement behavior.
/// Values other than `music` and `news` are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceCategory {
    #[default]
    Music,
    News,
    Other(String),
}

impl SourceCategory {
    pub fn as_str(&self) -> &str {
        match self {
            SourceCategory::Music => "music",
            SourceCategory::News => "news",
            SourceCategory::Other(value) => value,
        }
    }
}

impl From<String> for SourceCategory {
    fn from(value: String) -> Self {
        match value.as_str() {
            "music" => SourceCategory::Music,
            "news" => SourceCategory::News,
            _ => SourceCategory::Other(value),
        }
    }
}

impl From<SourceCategory> for String {
    fn from(category: SourceCategory) -> Self {
        match category {
            SourceCategory::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

/// A media origin the player cycles through (a playlist or a channel).
///
/// Field names on the wire match the `sources` table and `sources.json`:
/// `type`, `name`, `uri`, `source_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub name: String,
    pub uri: String, // Channel URL or playlist URI, unique per source
    #[serde(rename = "source_type", default)]
    pub category: SourceCategory,
}

impl Source {
    pub fn new(kind: SourceKind, name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            uri: uri.into(),
            category: SourceCategory::default(),
        }
    }

    pub fn with_category(mut self, category: SourceCategory) -> Self {
        self.category = category;
        self
    }

    /// Stable identifier of the source.
    pub fn id(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}) -> {}",
            self.name,
            self.kind,
            self.category.as_str(),
            self.uri
        )
    }
}

/// Serialized form of the watched set: `{"watched": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedSnapshot {
    #[serde(default)]
    pub watched: Vec<String>,
}

impl WatchedSnapshot {
    /// Builds a snapshot with ids sorted, so repeated saves of the same set
    /// produce identical files.
    pub fn from_set(set: &HashSet<String>) -> Self {
        let mut watched: Vec<String> = set.iter().cloned().collect();
        watched.sort();
        Self { watched }
    }

    pub fn into_set(self) -> HashSet<String> {
        self.watched.into_iter().collect()
    }
}
