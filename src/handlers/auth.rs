use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::cipher::sha256_hex;
use crate::state::AppState;

/// 認証済みの呼び出し元
///
/// `Authorization: Bearer <token>` のセッションから解決する。
/// 操作対象のユーザーは常にここから決まり、リクエストボディは参照しない。
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let user = state
            .sessions
            .find_user(&sha256_hex(token))
            .await?
            .ok_or_else(|| AppError::Authentication("unknown or expired session".to_string()))?;

        Ok(Self {
            user_id: user.user_id,
            email: user.email,
        })
    }
}

/// Authorization ヘッダーから Bearer トークンを取り出す
fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AppError::Authentication("missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Authentication("invalid authorization header".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if token.is_empty() {
        return Err(AppError::Authentication("missing bearer token".to_string()));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(header_value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/mfa");
        if let Some(value) = header_value {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_token_extracted() {
        let parts = parts_with(Some("Bearer abc.def"));
        assert_eq!(bearer_token(&parts).unwrap(), "abc.def");
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(bearer_token(&parts_with(None)).is_err());
    }

    #[test]
    fn test_other_scheme_rejected() {
        assert!(bearer_token(&parts_with(Some("Basic dXNlcjpwYXNz"))).is_err());
        assert!(bearer_token(&parts_with(Some("Bearer    "))).is_err());
    }
}
