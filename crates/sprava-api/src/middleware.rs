use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use axum_extra::typed_header::TypedHeaderRejection;

use sprava_gateway::Gateway;
use sprava_types::models::UserId;

/// The user a request was authenticated as.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

/// Resolve the bearer token in the Authorization header.
pub async fn require_auth(
    State(gateway): State<Gateway>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id = gateway
        .authenticate(bearer.token())
        .await
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}
