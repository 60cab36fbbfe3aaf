pub mod marker;
pub mod prompt;

pub use marker::{brand, is_bot_output, BOT_MARKER};
pub use prompt::{
    format_review_comment, format_sync_comment, parse_review_response, parse_score_response,
    review_system_prompt, review_user_prompt, score_system_prompt, score_user_prompt,
    ReviewResponse, ScoreResponse,
};

/// Version string reported by /health and embedded in generated comments.
pub fn service_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
