//! Prompt construction and engine response handling.
//!
//! The text-reasoning engine is asked for strict JSON. Engines still wrap
//! output in markdown fences often enough that the parsers tolerate it.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::marker::brand;

/// Parsed review output from the reasoning engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReviewResponse {
    /// Whether the review found anything worth a human's attention.
    #[serde(rename = "substantiveComments")]
    pub substantive_comments: bool,
    pub summary: String,
}

/// Parsed comment score from the reasoning engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScoreResponse {
    /// 0 (noise) to 10 (high-signal contribution).
    pub score: u8,
    pub reasoning: String,
}

pub fn review_system_prompt() -> String {
    "You are a careful senior engineer reviewing a pull request. \
     You will be given the list of changed files with their diffs. \
     Look for correctness problems, not style nits. \
     Respond with a JSON object and nothing else: \
     {\"substantiveComments\": <bool>, \"summary\": <string>}. \
     Set substantiveComments to true only if a human should act on the summary."
        .to_string()
}

/// User prompt for a review: one section per changed file.
pub fn review_user_prompt(files: &[(String, String)]) -> String {
    let mut prompt = String::from("Changed files and their diffs:\n");
    for (path, patch) in files {
        prompt.push_str(&format!("\n=== {} ===\n{}\n", path, patch));
    }
    prompt
}

pub fn score_system_prompt() -> String {
    "You rate the signal of a single issue comment in a software project. \
     Respond with a JSON object and nothing else: \
     {\"score\": <integer 0-10>, \"reasoning\": <string>}. \
     0 means pure noise, 10 means a high-signal actionable contribution."
        .to_string()
}

pub fn score_user_prompt(author: &str, comment_body: &str) -> String {
    format!(
        "Comment by {}:\n\nCOMMENT BEGINS\n{}\nCOMMENT ENDS\n",
        author, comment_body
    )
}

/// Strip a single surrounding markdown code fence, if present.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

pub fn parse_review_response(content: &str) -> Result<ReviewResponse> {
    serde_json::from_str(strip_fences(content)).context("Failed to parse review response JSON")
}

pub fn parse_score_response(content: &str) -> Result<ScoreResponse> {
    let parsed: ScoreResponse =
        serde_json::from_str(strip_fences(content)).context("Failed to parse score response JSON")?;
    anyhow::ensure!(parsed.score <= 10, "Score {} out of range", parsed.score);
    Ok(parsed)
}

/// Render a review as a PR comment. Always branded with the bot marker.
pub fn format_review_comment(review: &ReviewResponse, head_sha: &str, version: &str) -> String {
    let body = if review.substantive_comments {
        format!(
            "**Review complete**\n\n{}\n\n**Commit:** `{}`\n**Reviewer version:** {}",
            review.summary, head_sha, version
        )
    } else {
        format!(
            "**Review complete**\n\nNo issues found in this pull request.\n\n\
             **Commit:** `{}`\n**Reviewer version:** {}",
            head_sha, version
        )
    };
    brand(&body)
}

/// Render a comment relayed onto a copied issue. Always branded.
pub fn format_sync_comment(author: &str, source_repo: &str, source_number: u64, body: &str) -> String {
    brand(&format!(
        "Comment by **{}** on {}#{}:\n\n{}",
        author, source_repo, source_number, body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::is_bot_output;

    #[test]
    fn test_parse_review_response_plain_json() {
        let content = r#"{"substantiveComments": true, "summary": "Off-by-one in pagination"}"#;
        let review = parse_review_response(content).unwrap();
        assert!(review.substantive_comments);
        assert_eq!(review.summary, "Off-by-one in pagination");
    }

    #[test]
    fn test_parse_review_response_fenced() {
        let content =
            "```json\n{\"substantiveComments\": false, \"summary\": \"Looks good\"}\n```";
        let review = parse_review_response(content).unwrap();
        assert!(!review.substantive_comments);
        assert_eq!(review.summary, "Looks good");
    }

    #[test]
    fn test_parse_review_response_garbage() {
        assert!(parse_review_response("I could not produce JSON, sorry.").is_err());
    }

    #[test]
    fn test_parse_score_response() {
        let content = r#"{"score": 7, "reasoning": "Concrete reproduction steps"}"#;
        let score = parse_score_response(content).unwrap();
        assert_eq!(score.score, 7);
        assert_eq!(score.reasoning, "Concrete reproduction steps");
    }

    #[test]
    fn test_parse_score_response_out_of_range() {
        assert!(parse_score_response(r#"{"score": 11, "reasoning": "x"}"#).is_err());
    }

    #[test]
    fn test_review_comment_is_branded() {
        let review = ReviewResponse {
            substantive_comments: true,
            summary: "Found a race".to_string(),
        };
        let comment = format_review_comment(&review, "abc1234", "0.1.0");
        assert!(is_bot_output(&comment));
        assert!(comment.contains("Found a race"));
        assert!(comment.contains("`abc1234`"));
    }

    #[test]
    fn test_clean_review_comment_omits_summary() {
        let review = ReviewResponse {
            substantive_comments: false,
            summary: "should not appear".to_string(),
        };
        let comment = format_review_comment(&review, "def5678", "0.1.0");
        assert!(comment.contains("No issues found"));
        assert!(!comment.contains("should not appear"));
    }

    #[test]
    fn test_sync_comment_is_branded() {
        let comment = format_sync_comment("alice", "acme/widgets", 42, "ping");
        assert!(is_bot_output(&comment));
        assert!(comment.contains("acme/widgets#42"));
        assert!(comment.contains("ping"));
    }

    #[test]
    fn test_review_user_prompt_lists_files() {
        let files = vec![
            ("src/lib.rs".to_string(), "@@ -1 +1 @@".to_string()),
            ("src/main.rs".to_string(), "@@ -2 +2 @@".to_string()),
        ];
        let prompt = review_user_prompt(&files);
        assert!(prompt.contains("=== src/lib.rs ==="));
        assert!(prompt.contains("=== src/main.rs ==="));
    }
}
