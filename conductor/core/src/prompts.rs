//! Prompt Texts and Personas
//!
//! Every instruction the engine sends to a model lives here, so wording can
//! be tuned without touching control flow.

/// Which bot the conversation runs as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Persona {
    /// Intent-driven assistant: chat, images, web pages, suggestions
    Generalbot,
    /// Sales conversation driven by suggested customer questions
    Salesbot,
}

impl Persona {
    /// Resolve a persona by name; unknown names fall back to Generalbot
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("salesbot") {
            Self::Salesbot
        } else {
            Self::Generalbot
        }
    }

    /// Display name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Generalbot => "Generalbot",
            Self::Salesbot => "Salesbot",
        }
    }

    /// System prompt establishing the persona
    #[must_use]
    pub fn instructions(self) -> &'static str {
        match self {
            Self::Generalbot => GENERALBOT_INSTRUCTIONS,
            Self::Salesbot => SALESBOT_INSTRUCTIONS,
        }
    }

    /// User prompt that makes the bot introduce itself
    #[must_use]
    pub fn greeting(self) -> &'static str {
        match self {
            Self::Generalbot => GENERALBOT_BEGIN,
            Self::Salesbot => SALESBOT_BEGIN,
        }
    }

    /// System prompt for generating the other side's next question
    #[must_use]
    pub fn customer_instructions(self) -> &'static str {
        match self {
            Self::Generalbot => GENERAL_USER_INSTRUCTIONS,
            Self::Salesbot => SALES_CUSTOMER_INSTRUCTIONS,
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Salesbot persona
pub const SALESBOT_INSTRUCTIONS: &str = "\
You are Salesbot, a professional salesperson. Your language is concise and \
formal while staying friendly and personable. Help the prospective customer \
get the most out of your product line and explain why owning the product \
would benefit them. Never pressure the customer; offer a few options from the \
product line that fit their needs. The customer will name a product or a \
need and you reply with your pitch. If they name neither, work with them to \
find out what you should be selling. Reply in a single paragraph of no more \
than 3 sentences.
Markdown may be used sparingly. No headings or titles. Do not embed images.";

/// Salesbot greeting request
pub const SALESBOT_BEGIN: &str = "\
Start your sales introduction now. Introduce yourself and do not mention or \
acknowledge this message.";

/// Generalbot persona
pub const GENERALBOT_INSTRUCTIONS: &str = "\
You are Generalbot, a general purpose chatbot. You can make small talk, \
generate images on request, and read web pages the user points you at (the \
user may ask how). Introduce yourself professionally and concisely.
Use Markdown sparingly, only where lists or emphasis are really needed. \
Stay under 50 words. No headings or titles. Do not embed images.";

/// Generalbot greeting request
pub const GENERALBOT_BEGIN: &str = "\
Start your introduction. Do not acknowledge this message.";

/// Customer role for Salesbot suggestions
pub const SALES_CUSTOMER_INSTRUCTIONS: &str = "\
You play the prospective customer talking to Salesbot. Read the chat log that \
follows and write one 3-7 word question the customer could ask next to keep \
the sales conversation going.
Write from the customer's point of view, in the first person. Output plain \
text only: no introduction, no quotes, one sentence ending in a question mark.
The question should be about how Salesbot's products benefit the customer's \
operations. Do not mention specific numbers.
Keep it short and formal. Avoid adjectives, adverbs, conjunctions and filler \
transitions. Cover a single topic.
Salesbot is not a product. Never ask about Salesbot, sales assistants or chat \
bots.
Never use more than 10 words; aim for about 5.";

/// User role for Generalbot suggestions
pub const GENERAL_USER_INSTRUCTIONS: &str = "\
You play the user talking to Generalbot. Read the chat log that follows and \
write one short question or request the user could send next.
Write from the user's point of view, in the first person. Output plain text \
only: no introduction, no quotes, a single sentence.
Stay on the topics already discussed, or suggest something Generalbot can \
do such as drawing an image or reading a web page.
Never ask about Generalbot or chat bots themselves. Never use more than 12 \
words.";

/// Final instruction of a suggestion request, excluding earlier candidates
#[must_use]
pub fn customer_begin(already_used: &[String]) -> String {
    let mut prompt = String::from(
        "Write the next question now. Do not mention or acknowledge this message.",
    );
    if !already_used.is_empty() {
        prompt.push_str("\nIt must be different from each of these:\n");
        prompt.push_str(&already_used.join("\n"));
    }
    prompt
}

/// Single-letter intent classification
pub const CHAT_IDENTIFICATION_INSTRUCTIONS: &str = "\
Classify the user message that follows.
If it asks for an image to be generated from a description, output the letter I.
If it refers to an external website, output the letter S.
If it asks for ideas of what to talk about, output the letter Q.
If it is an ordinary text prompt or question, output the letter G. G is the \
default; anything that does not fit the other categories is G.
Output exactly one character and nothing else: no quotes, no introduction.";

/// Keyword-list derivation for image generation
pub const IMAGE_PROMPT_INSTRUCTIONS: &str = "\
Turn the user's description of an image into a prompt for a Stable Diffusion \
client: a list of short terms separated by commas.
Output only the prompt itself, without quotes or introduction.
Each term is 1 to 3 simple words. Do not write sentences or long phrases.";

/// Standalone restatement of the latest user message
pub const REWRITE_INSTRUCTIONS: &str = "\
Restate the user's latest message as one clear, standalone instruction that \
makes sense without the rest of the conversation. Resolve references such as \
'it' or 'that page' using the conversation so far. Keep every URL exactly as \
written. Output only the restated instruction.";

/// JSON intent summary of a restated instruction
pub const INTENT_SUMMARY_INSTRUCTIONS: &str = r#"Read the instruction that follows and describe what the user wants as a JSON object with exactly these fields:
{
  "userWantsImageGenerated": boolean,
  "includeTextResponseInAdditionToImage": boolean,
  "userWantsSimpleChatResponse": boolean,
  "urlsFromUserChatBotShouldRead": [string]
}
userWantsImageGenerated is true only when the user asks for a picture to be created.
urlsFromUserChatBotShouldRead lists every web address the user wants read, in order; use an empty list when there are none.
Output only the JSON object."#;

/// Boilerplate removal for fetched page text
pub const CROP_INSTRUCTIONS: &str = "\
The following is the text of a web page. Repeat its meaningful content word \
for word, but leave out navigation menus, cookie notices, footers, \
advertisements and other boilerplate. Do not summarize or comment. Output \
only the kept text.";

/// Minimal prompt used to keep the model loaded
pub const KEEPALIVE_PROMPT: &str = "Reply with the single word: ok";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_from_name() {
        assert_eq!(Persona::from_name("Salesbot"), Persona::Salesbot);
        assert_eq!(Persona::from_name(" salesbot "), Persona::Salesbot);
        assert_eq!(Persona::from_name("Generalbot"), Persona::Generalbot);
        assert_eq!(Persona::from_name("Pirate"), Persona::Generalbot);
    }

    #[test]
    fn test_customer_begin_lists_exclusions() {
        let first = customer_begin(&[]);
        assert!(!first.contains("different"));

        let used = vec!["What does it cost?".to_string(), "Is it fast?".to_string()];
        let prompt = customer_begin(&used);
        assert!(prompt.ends_with("What does it cost?\nIs it fast?"));
    }

    #[test]
    fn test_intent_prompt_names_all_fields() {
        for field in [
            "userWantsImageGenerated",
            "includeTextResponseInAdditionToImage",
            "userWantsSimpleChatResponse",
            "urlsFromUserChatBotShouldRead",
        ] {
            assert!(INTENT_SUMMARY_INSTRUCTIONS.contains(field));
        }
    }
}
