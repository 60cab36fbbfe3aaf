//! Bot-output marking.
//!
//! Every piece of content the bot posts to GitHub carries a fixed marker
//! string (an HTML comment, invisible when rendered). Inbound webhook
//! content containing the marker is the bot's own prior output arriving
//! back as a fresh event; coordinators skip it before touching the store,
//! which is what breaks the feedback loop.

/// Marker embedded in everything the bot writes.
///
/// Must never change between releases: content posted by an old version
/// still has to be recognized by a new one.
pub const BOT_MARKER: &str = "<!-- octorelay:bot-output -->";

/// Append the marker to outbound content.
pub fn brand(body: &str) -> String {
    format!("{}\n\n{}", body, BOT_MARKER)
}

/// Whether inbound content is the bot's own prior output.
pub fn is_bot_output(body: &str) -> bool {
    body.contains(BOT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branded_output_is_detected() {
        let branded = brand("A review of this pull request.");
        assert!(is_bot_output(&branded));
    }

    #[test]
    fn test_plain_content_is_not_detected() {
        assert!(!is_bot_output("Just a normal comment from a human."));
        assert!(!is_bot_output(""));
    }

    #[test]
    fn test_marker_survives_quoting() {
        // GitHub reply-quoting prefixes lines with "> "; the marker is still
        // present as a substring and must still be detected.
        let branded = brand("Original");
        let quoted: String = branded.lines().map(|l| format!("> {}\n", l)).collect();
        assert!(is_bot_output(&quoted));
    }

    #[test]
    fn test_brand_keeps_original_body() {
        let branded = brand("hello");
        assert!(branded.starts_with("hello"));
        assert!(branded.ends_with(BOT_MARKER));
    }
}
