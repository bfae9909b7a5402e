//! Game-type whitelist
//!
//! Tunnel requests name a game so chat output and the MOTD probe know what is
//! behind the port. Anything outside the whitelist is rejected with the legal
//! set spelled out.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    Minecraft,
    Terraria,
    DontStarveTogether,
    Starbound,
    Factorio,
    Valheim,
    Palworld,
}

impl GameType {
    pub const ALL: [GameType; 7] = [
        GameType::Minecraft,
        GameType::Terraria,
        GameType::DontStarveTogether,
        GameType::Starbound,
        GameType::Factorio,
        GameType::Valheim,
        GameType::Palworld,
    ];

    /// Resolve a user-supplied name through the alias table, case-insensitively.
    pub fn resolve(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "minecraft" | "mc" => Some(GameType::Minecraft),
            "terraria" | "tr" => Some(GameType::Terraria),
            "dont_starve_together" | "dst" => Some(GameType::DontStarveTogether),
            "starbound" => Some(GameType::Starbound),
            "factorio" => Some(GameType::Factorio),
            "valheim" => Some(GameType::Valheim),
            "palworld" => Some(GameType::Palworld),
            _ => None,
        }
    }

    /// Canonical identifier, matches the serde representation.
    pub fn id(&self) -> &'static str {
        match self {
            GameType::Minecraft => "minecraft",
            GameType::Terraria => "terraria",
            GameType::DontStarveTogether => "dont_starve_together",
            GameType::Starbound => "starbound",
            GameType::Factorio => "factorio",
            GameType::Valheim => "valheim",
            GameType::Palworld => "palworld",
        }
    }

    /// Four-character abbreviation used in proxy names.
    pub fn abbrev(&self) -> &'static str {
        match self {
            GameType::Minecraft => "mine",
            GameType::Terraria => "terr",
            GameType::DontStarveTogether => "dsto",
            GameType::Starbound => "star",
            GameType::Factorio => "fact",
            GameType::Valheim => "valh",
            GameType::Palworld => "palw",
        }
    }

    /// Display name for chat messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            GameType::Minecraft => "Minecraft",
            GameType::Terraria => "Terraria",
            GameType::DontStarveTogether => "Don't Starve Together",
            GameType::Starbound => "Starbound",
            GameType::Factorio => "Factorio",
            GameType::Valheim => "Valheim",
            GameType::Palworld => "Palworld",
        }
    }
}

/// The error text listing the legal set, used by the `open` command.
pub fn legal_set_message() -> String {
    let names: Vec<&str> = GameType::ALL.iter().map(|g| g.id()).collect();
    format!("未知的游戏类型，支持: {}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_canonical_names() {
        for game in GameType::ALL {
            assert_eq!(GameType::resolve(game.id()), Some(game));
        }
    }

    #[test]
    fn test_resolve_aliases() {
        assert_eq!(GameType::resolve("mc"), Some(GameType::Minecraft));
        assert_eq!(GameType::resolve("tr"), Some(GameType::Terraria));
        assert_eq!(GameType::resolve("dst"), Some(GameType::DontStarveTogether));
    }

    #[test]
    fn test_resolve_case_insensitive() {
        assert_eq!(GameType::resolve("MC"), Some(GameType::Minecraft));
        assert_eq!(GameType::resolve("Valheim"), Some(GameType::Valheim));
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(GameType::resolve("quake"), None);
        assert_eq!(GameType::resolve(""), None);
    }

    #[test]
    fn test_abbrev_is_four_chars() {
        for game in GameType::ALL {
            assert_eq!(game.abbrev().len(), 4, "abbrev for {:?}", game);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&GameType::DontStarveTogether).unwrap();
        assert_eq!(json, "\"dont_starve_together\"");
        let back: GameType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, GameType::DontStarveTogether);
    }

    #[test]
    fn test_legal_set_message_lists_all() {
        let msg = legal_set_message();
        for game in GameType::ALL {
            assert!(msg.contains(game.id()));
        }
    }
}
