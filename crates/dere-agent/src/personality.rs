use std::path::PathBuf;

use tracing::warn;

/// Loads personality prompt files from `~/.config/dere/personalities/`.
///
/// A personality is a markdown file whose full content becomes (part of) the
/// session system prompt. Session configs may name several, comma-separated.
pub struct PersonalityLoader {
    dir: PathBuf,
}

impl PersonalityLoader {
    pub fn new() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            dir: PathBuf::from(home).join(".config/dere/personalities"),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read one personality's prompt content, if the file exists.
    pub fn load(&self, name: &str) -> Option<String> {
        let path = self.dir.join(format!("{name}.md"));
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => Some(content),
            Ok(_) => None,
            Err(_) => {
                warn!(personality = name, path = %path.display(), "personality file not found");
                None
            }
        }
    }

    /// Build the personality portion of a system prompt from a
    /// comma-separated name list. Missing names are skipped with a warning.
    pub fn build_prompt(&self, names: &str) -> String {
        let prompts: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .filter_map(|n| self.load(n))
            .collect();
        prompts.join("\n\n")
    }
}

impl Default for PersonalityLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Environmental context block appended to system prompts.
pub fn time_context() -> String {
    let now = chrono::Local::now();
    format!(
        "\n\n## Environmental Context\nCurrent time: {}, {}",
        now.format("%H:%M"),
        now.format("%A, %B %e %Y")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_personality_yields_empty_prompt() {
        let loader = PersonalityLoader::with_dir("/nonexistent");
        assert_eq!(loader.build_prompt("tsun"), "");
    }

    #[test]
    fn comma_separated_names_are_concatenated() {
        let dir = std::env::temp_dir().join(format!("dere-persona-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.md"), "You are A.").unwrap();
        std::fs::write(dir.join("b.md"), "You are B.").unwrap();

        let loader = PersonalityLoader::with_dir(&dir);
        assert_eq!(loader.build_prompt("a, b"), "You are A.\n\nYou are B.");
        assert_eq!(loader.build_prompt("a, missing"), "You are A.");

        std::fs::remove_dir_all(&dir).ok();
    }
}
