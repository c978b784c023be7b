//! `readiness`: is this symbol ready for a given signal?

use anyhow::{anyhow, Result};
use chrono::Utc;
use garde::Validate;

use crate::signal::readiness::check_readiness;

use super::response_types::ReadinessResponse;
use super::AppContext;

#[derive(Debug, Validate)]
pub struct ReadinessParams {
    #[garde(length(min = 1, max = 10), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub symbol: String,
    #[garde(length(min = 1, max = 50))]
    pub signal_type: String,
}

pub fn execute(ctx: &AppContext, params: &ReadinessParams) -> Result<ReadinessResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let readiness = check_readiness(&ctx.repo, &params.symbol, &params.signal_type, Utc::now())?;
    Ok(ReadinessResponse { readiness })
}
