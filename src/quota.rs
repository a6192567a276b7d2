use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::AppState;
use crate::auth::Caller;
use crate::db::QuotaView;
use crate::error::GatewayError;

/// First matching rule wins: block flag, daily cost, daily requests,
/// monthly cost. A passing view is attached for the orchestrator; the
/// debit itself happens post-stream, once the actual cost is known.
pub fn evaluate(view: &QuotaView) -> Result<(), GatewayError> {
    if view.is_blocked {
        return Err(GatewayError::UserBlocked);
    }
    if view.daily_used_usd >= view.daily_limit_usd {
        return Err(GatewayError::QuotaExceeded("daily cost limit exceeded".into()));
    }
    if view.daily_requests >= view.daily_request_limit {
        return Err(GatewayError::QuotaExceeded(
            "daily request limit exceeded".into(),
        ));
    }
    if view.monthly_used_usd >= view.monthly_quota_usd {
        return Err(GatewayError::QuotaExceeded("monthly quota exceeded".into()));
    }
    Ok(())
}

/// Quota middleware; runs after auth and rejects before any upstream work
pub async fn enforce_quota(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(caller) = request.extensions().get::<Caller>().cloned() else {
        return GatewayError::AuthFailure("user not authenticated".into()).into_response();
    };

    let Some(store) = &state.store else {
        return GatewayError::DatabaseError("store unavailable".into()).into_response();
    };

    let view = match store.check_quota(&caller.user_id).await {
        Ok(v) => v,
        Err(err) => return err.into_response(),
    };

    if let Err(err) = evaluate(&view) {
        debug!(
            user_id = %caller.user_id,
            daily_used = view.daily_used_usd,
            daily_requests = view.daily_requests,
            monthly_used = view.monthly_used_usd,
            monthly_requests = view.monthly_requests,
            blocked_reason = %view.blocked_reason,
            reason = %err,
            "quota rejection"
        );
        return err.into_response();
    }

    request.extensions_mut().insert(view);
    next.run(request).await
}
