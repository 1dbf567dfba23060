//! Outbound URL resolution for provider requests

use crate::collaborators::ProviderEndpoint;
use crate::domain::ProviderTarget;
use crate::proxy::types::*;
use http::Uri;

/// Joins a provider base URL with the path and query of the inbound call
pub struct UrlResolver;

impl UrlResolver {
    /// Validates the configured base URL of an endpoint
    pub fn base_url(endpoint: &ProviderEndpoint) -> ProxyResult<TargetUrl> {
        TargetUrl::try_new(endpoint.base_url.clone()).map_err(|e| {
            ProxyError::InvalidTargetUrl(format!(
                "Invalid base URL '{}' for provider {}: {e}",
                endpoint.base_url, endpoint.name
            ))
        })
    }

    /// Resolve the final URI for the outgoing request
    ///
    /// Scheme and authority come from the base URL. A base URL path acts as
    /// a prefix; the inbound path and query are preserved after it.
    pub fn resolve_target_uri(base_url: &TargetUrl, target: &ProviderTarget) -> ProxyResult<Uri> {
        let base_uri: Uri = base_url
            .as_ref()
            .parse()
            .map_err(|_| ProxyError::InvalidTargetUrl(base_url.as_ref().to_string()))?;

        if base_uri.query().is_some() {
            return Err(ProxyError::InvalidTargetUrl(format!(
                "Base URL must not carry a query: {base_url}"
            )));
        }

        let path_and_query = if target.path_and_query.is_empty() {
            DEFAULT_PATH
        } else {
            target.path_and_query.as_str()
        };

        let final_uri_str = format!(
            "{}{}",
            base_url.as_ref().trim_end_matches('/'),
            path_and_query
        );

        final_uri_str
            .parse()
            .map_err(|_| ProxyError::InvalidTargetUrl(final_uri_str))
    }

    pub fn resolve(endpoint: &ProviderEndpoint, target: &ProviderTarget) -> ProxyResult<Uri> {
        let base_url = Self::base_url(endpoint)?;
        Self::resolve_target_uri(&base_url, target)
    }
}
