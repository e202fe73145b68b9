use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::web::middleware::auth::bearer_token;
use crate::web::web_state;

#[handler]
pub async fn post_event(req: &mut Request, res: &mut Response) {
    let header = req.header::<String>("authorization");
    let query_token = req.query::<String>("token");
    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(err) => {
            res.status_code(StatusCode::BAD_REQUEST);
            res.render(Json(json!({ "error": format!("invalid event body: {err}") })));
            return;
        }
    };

    let listener = &web_state().chat_events;
    let provided = verification_token(&body, query_token, header.as_deref());
    if !listener.verify_token(provided.as_deref()) {
        warn!("rejected google chat event with a bad verification token");
        res.status_code(StatusCode::UNAUTHORIZED);
        res.render(Json(json!({ "error": "bad verification token" })));
        return;
    }

    match listener.handle(&body).await {
        Ok(queued) => {
            debug!("accepted google chat delivery queued={}", queued);
            res.render(Json(json!({})));
        }
        Err(err) => {
            error!("failed to queue google chat event: {}", err);
            res.status_code(StatusCode::SERVICE_UNAVAILABLE);
            res.render(Json(json!({ "error": "bridge is shutting down" })));
        }
    }
}

/// Interaction payloads carry the token in the body; push subscriptions use the
/// endpoint query or a bearer header.
fn verification_token(body: &Value, query: Option<String>, header: Option<&str>) -> Option<String> {
    body.get("token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(query)
        .or_else(|| bearer_token(header))
}
