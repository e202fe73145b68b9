use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::web::web_state;

pub(crate) fn render_matrix_error(res: &mut Response, status: StatusCode, errcode: &str, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "errcode": errcode, "error": message })));
}

#[handler]
pub async fn put_transaction(req: &mut Request, res: &mut Response) {
    let Some(txn_id) = req.param::<String>("txn_id") else {
        render_matrix_error(res, StatusCode::BAD_REQUEST, "M_MISSING_PARAM", "missing txn_id");
        return;
    };
    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(err) => {
            render_matrix_error(
                res,
                StatusCode::BAD_REQUEST,
                "M_NOT_JSON",
                &format!("invalid transaction body: {err}"),
            );
            return;
        }
    };

    match web_state()
        .matrix_events
        .process_transaction(&txn_id, &body)
        .await
    {
        Ok(queued) => {
            debug!("accepted transaction txn_id={} queued={}", txn_id, queued);
            res.render(Json(json!({})));
        }
        Err(err) => {
            error!("failed to queue transaction txn_id={}: {}", txn_id, err);
            render_matrix_error(
                res,
                StatusCode::SERVICE_UNAVAILABLE,
                "M_UNKNOWN",
                "bridge is shutting down",
            );
        }
    }
}

/// Ghosts are registered lazily, so any id in the ghost namespace exists.
#[handler]
pub async fn query_user(req: &mut Request, res: &mut Response) {
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    let puppets = &web_state().orchestrator.context().puppets;
    if puppets.is_ghost_user_id(&user_id) {
        res.render(Json(json!({})));
    } else {
        render_matrix_error(res, StatusCode::NOT_FOUND, "M_NOT_FOUND", "user is not bridged");
    }
}
