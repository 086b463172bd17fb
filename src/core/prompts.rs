//! Prompt text for the structured generator.

use crate::domain::plan::GENRES;

/// Planning request; the stored copy doubles as the work item's directive
pub fn segment_prompt(text: &str, count: usize) -> String {
    format!(
        "Generate a surprising YouTube video script from this text: '{text}'.
IMPORTANT REQUIREMENTS:
1. The output MUST have EXACTLY {count} scenes - no more, no less.
2. Each scene MUST be a separate object in a JSON array.
3. Each 'scene' object MUST have:
   - Key 'scene' with value as scene number (1 through {count})
   - Key 'image' with value as text description for AI image generation
   - Key 'text' with value as narration text for the scene
4. Scene {count} MUST be a creative way to say 'subscribe and like our video'"
    )
}

pub fn title_prompt(text: &str) -> String {
    format!(
        "I want YouTube video title and description in JSON format only from this text '{text}'. \
         Do not include any text or explanations."
    )
}

pub fn genre_prompt(text: &str) -> String {
    format!(
        "I want YouTube video background music from this text '{text}'. \
         choose one of those genres ({}).",
        GENRES.join("|")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_prompt_names_the_count() {
        let prompt = segment_prompt("Koalas sleep 22 hours a day.", 4);
        assert!(prompt.contains("EXACTLY 4 scenes"));
        assert!(prompt.contains("(1 through 4)"));
        assert!(prompt.contains("Scene 4 MUST"));
    }

    #[test]
    fn test_genre_prompt_lists_every_genre() {
        let prompt = genre_prompt("x");
        assert!(prompt.contains("(bright|calm|dark|dramatic|funky|happy|inspirational|sad)"));
    }
}
