//! Feed access seam.
//!
//! The scheduler and discovery only see this trait. Its error type keeps
//! "not found" apart from every other failure, because the circuit breaker
//! treats the two very differently.

use async_trait::async_trait;
use thiserror::Error;

use crate::circuit_breaker::FailureKind;
use crate::types::{RankingEntry, RawPrediction};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("blocked by upstream (status {0})")]
    Blocked(u16),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NotFound(_) => FailureKind::NotFound,
            _ => FailureKind::Transient,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Ranked candidate list, best first
    async fn fetch_ranking(&self) -> Result<Vec<RankingEntry>, FetchError>;

    /// One page of an entity's activity feed
    async fn fetch_activity(&self, entity_id: &str, page: u32) -> Result<Vec<RawPrediction>, FetchError>;
}
