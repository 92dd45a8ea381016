//! Model categories and client-facing alias resolution

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Abstract model tier a client requests instead of a concrete model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Big,
    Middle,
    Small,
}

impl ModelCategory {
    /// All categories, largest first
    pub const ALL: [ModelCategory; 3] = [ModelCategory::Big, ModelCategory::Middle, ModelCategory::Small];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Big => "big",
            ModelCategory::Middle => "middle",
            ModelCategory::Small => "small",
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "big" => Ok(ModelCategory::Big),
            "middle" => Ok(ModelCategory::Middle),
            "small" => Ok(ModelCategory::Small),
            other => Err(format!("unknown model category '{}'", other)),
        }
    }
}

/// Resolve a client-facing model name to a category.
///
/// Resolution order: exact configured alias, then the category name itself,
/// then the tier keyword embedded in the name (`opus`, `sonnet`, `haiku`).
pub fn resolve_category(
    model: &str,
    aliases: &HashMap<String, ModelCategory>,
) -> Option<ModelCategory> {
    if let Some(category) = aliases.get(model) {
        return Some(*category);
    }

    if let Ok(category) = model.parse::<ModelCategory>() {
        return Some(category);
    }

    let lower = model.to_ascii_lowercase();
    if lower.contains("opus") {
        Some(ModelCategory::Big)
    } else if lower.contains("sonnet") {
        Some(ModelCategory::Middle)
    } else if lower.contains("haiku") {
        Some(ModelCategory::Small)
    } else {
        None
    }
}
