//! Prompt templates shared by generation and training

const USER_PREFIX: &str = "### User: ";
const ASSISTANT_PREFIX: &str = "\n### Assistant:";

/// Wrap a user turn in the chat template, leaving the assistant turn open
pub fn chat_prompt(user_text: &str) -> String {
    format!("{}{}{}", USER_PREFIX, user_text.trim(), ASSISTANT_PREFIX)
}

/// Prompt for a fresh note on `content`
pub fn note_prompt(content: &str) -> String {
    chat_prompt(&format!("Write a study note about: {}", content.trim()))
}

/// Prompt for a replacement of a rejected note
pub fn regeneration_prompt(content: &str, prior_note: &str) -> String {
    chat_prompt(&format!(
        "Write a study note about: {}\nThe previous note was rejected: {}",
        content.trim(),
        prior_note.trim()
    ))
}

/// Prompt and response halves of a supervised example.
///
/// Concatenated they read `### User: ...\n### Assistant: {output}`; the
/// trainer appends the end-of-sequence token after the response.
pub fn training_pair(input: &str, output: &str) -> (String, String) {
    (note_prompt(input), format!(" {}", output.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_pair_matches_generation_prompt() {
        let (prompt, response) = training_pair(" Gravity ", "Mass attracts mass.");
        assert_eq!(prompt, note_prompt("Gravity"));
        assert_eq!(
            format!("{}{}", prompt, response),
            "### User: Write a study note about: Gravity\n### Assistant: Mass attracts mass."
        );
    }

    #[test]
    fn test_regeneration_mentions_prior() {
        let prompt = regeneration_prompt("Gravity", "Things fall.");
        assert!(prompt.starts_with(USER_PREFIX));
        assert!(prompt.contains("Things fall."));
        assert!(prompt.ends_with(ASSISTANT_PREFIX));
    }
}
