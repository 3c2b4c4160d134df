//! Optional language-model collaborators. Nothing in the alert or expense
//! paths depends on them succeeding.

use async_trait::async_trait;

use crate::database::models::Category;
use crate::error::AppResult;
use crate::limits::period::Period;

pub mod groq;

pub use groq::GroqClient;

#[async_trait]
pub trait AlertMessageGenerator: Send + Sync {
    /// One short sentence describing how close the user is to the limit.
    async fn alert_message(
        &self,
        alert_percentage: i64,
        current_percentage: f64,
        period: Period,
    ) -> AppResult<Option<String>>;
}

#[async_trait]
pub trait CategoryClassifier: Send + Sync {
    /// Best-guess category id for `text`. Must be one of `candidates`.
    async fn classify(&self, text: &str, candidates: &[Category]) -> AppResult<Option<i64>>;
}
