//! `sources`: current provider routing and health.

use anyhow::Result;

use super::response_types::{ProviderStatus, SourcesResponse};
use super::AppContext;

pub async fn execute(ctx: &AppContext) -> Result<SourcesResponse> {
    let mut providers = Vec::new();
    for name in ctx.registry.provider_names() {
        let available = ctx.registry.is_available_cached(&name).await;
        let capabilities = ctx
            .registry
            .capabilities_of(&name)
            .into_iter()
            .map(|c| format!("{c:?}"))
            .collect();
        let last_error = ctx.registry.get(&name).and_then(|p| p.last_error());
        providers.push(ProviderStatus {
            name,
            enabled: true,
            available,
            capabilities,
            last_error,
        });
    }

    let disabled = ctx
        .registry
        .disabled_providers()
        .iter()
        .map(|(name, reason)| (name.clone(), reason.clone()))
        .collect();

    Ok(SourcesResponse {
        primary: ctx.registry.primary_name().map(str::to_string),
        fallback: ctx.registry.fallback_name().map(str::to_string),
        providers,
        disabled,
    })
}
