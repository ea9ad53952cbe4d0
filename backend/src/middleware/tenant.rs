//! Tenant extraction
//!
//! Tenant resolution happens upstream; the ledger trusts the `X-Tenant-Id`
//! header it is handed and only checks that it is a UUID.

use axum::{
    http::{request::Parts, StatusCode},
    Json,
};
use uuid::Uuid;

use crate::error::{ErrorDetail, ErrorResponse};

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant owning every record a request touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(TenantId)
            .ok_or_else(|| {
                let error = ErrorResponse {
                    error: ErrorDetail {
                        code: "MISSING_TENANT".to_string(),
                        message: "X-Tenant-Id header must carry a tenant UUID".to_string(),
                        violations: None,
                        shortfall: None,
                    },
                };
                (StatusCode::BAD_REQUEST, Json(error))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::FromRequestParts;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<TenantId, StatusCode> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(TENANT_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        TenantId::from_request_parts(&mut parts, &())
            .await
            .map_err(|(status, _)| status)
    }

    #[tokio::test]
    async fn test_reads_tenant_header() {
        let tenant = Uuid::new_v4();
        let extracted = extract(Some(&tenant.to_string())).await.unwrap();
        assert_eq!(extracted, TenantId(tenant));
    }

    #[tokio::test]
    async fn test_rejects_missing_or_malformed_tenant() {
        assert_eq!(extract(None).await.unwrap_err(), StatusCode::BAD_REQUEST);
        assert_eq!(
            extract(Some("not-a-uuid")).await.unwrap_err(),
            StatusCode::BAD_REQUEST
        );
    }
}
