//! `reports`: stored validation report bodies for a symbol.

use anyhow::{anyhow, Result};
use garde::Validate;

use crate::model::DataType;

use super::response_types::ReportsResponse;
use super::AppContext;

#[derive(Debug, Validate)]
pub struct ReportsParams {
    #[garde(length(min = 1, max = 10), pattern(r"^[A-Za-z0-9.\-]+$"))]
    pub symbol: String,
    #[garde(skip)]
    pub data_type: Option<DataType>,
    #[garde(range(min = 1, max = 500))]
    pub limit: usize,
}

pub fn execute(ctx: &AppContext, params: &ReportsParams) -> Result<ReportsResponse> {
    params.validate().map_err(|e| anyhow!("validation error: {e}"))?;
    let symbol = params.symbol.to_uppercase();
    let reports = ctx
        .repo
        .get_validation_reports(&symbol, params.data_type, params.limit)?;
    Ok(ReportsResponse { symbol, reports })
}
