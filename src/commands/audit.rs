//! `audit`: recent fetch audit records for a symbol.

use anyhow::{anyhow, Result};
use garde::Validate;

use super::response_types::AuditResponse;
use super::AppContext;

#[derive(Debug, Validate)]
pub struct AuditParams {
    #[garde(length(min = 1, max = 10), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub symbol: String,
    #[garde(range(min = 1, max = 500))]
    pub limit: usize,
}

pub fn execute(ctx: &AppContext, params: &AuditParams) -> Result<AuditResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let symbol = params.symbol.to_uppercase();
    let records = ctx.repo.get_audit_records(&symbol, params.limit)?;
    Ok(AuditResponse { symbol, records })
}
