//! Safe command surface.
//!
//! An enumerated catalog of command categories used purely for prompt
//! construction; the sandbox itself does no allowlisting.

/// Category name and representative commands.
pub fn allowed_commands() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        (
            "build/package",
            &["npm install", "npm run build", "pip install", "mamba env update", "go build", "mvn package", "bundle install", "cargo build"],
        ),
        (
            "test",
            &["npm test", "pytest", "go test ./...", "mvn test", "bundle exec rspec", "cargo test"],
        ),
        (
            "linter/formatter",
            &["eslint", "prettier --check", "ruff check", "black --check", "gofmt -l", "rubocop"],
        ),
        (
            "file operations",
            &["ls", "cat", "head", "tail", "find", "mkdir", "cp", "mv", "rm"],
        ),
        (
            "version control",
            &["git status", "git diff", "git add", "git commit", "git checkout", "git log", "git push"],
        ),
        ("utilities", &["grep", "sed", "awk", "wc", "which", "env", "curl"]),
    ]
}

/// Human-readable catalog for system prompts.
pub fn allowed_commands_text() -> String {
    let mut text = String::from("Available command categories:\n");
    for (category, commands) in allowed_commands() {
        text.push_str(&format!("- {}: {}\n", category, commands.join(", ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_covers_expected_categories() {
        let categories: Vec<&str> = allowed_commands().iter().map(|(c, _)| *c).collect();
        assert!(categories.contains(&"build/package"));
        assert!(categories.contains(&"test"));
        assert!(categories.contains(&"version control"));
        assert_eq!(categories.len(), 6);
    }

    #[test]
    fn test_text_lists_every_category() {
        let text = allowed_commands_text();
        for (category, _) in allowed_commands() {
            assert!(text.contains(category));
        }
    }
}
