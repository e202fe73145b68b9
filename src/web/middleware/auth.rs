use salvo::prelude::*;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::web::handlers::{
    googlechat::post_event,
    health::{get_status, health_check},
    metrics::metrics,
    provisioning::{
        get_portal, link_user, list_portals, list_users, provision_portal, sync_portal,
        unlink_user,
    },
    transactions::{put_transaction, query_user},
};
use crate::web::web_state;

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics))
        .push(Router::with_path("status").get(get_status))
        .push(
            Router::with_path("_matrix/app/v1")
                .hoop(require_homeserver_token)
                .push(Router::with_path("transactions/{txn_id}").put(put_transaction))
                .push(Router::with_path("users/{user_id}").get(query_user)),
        )
        .push(
            Router::with_path("transactions/{txn_id}")
                .hoop(require_homeserver_token)
                .put(put_transaction),
        )
        .push(Router::with_path("googlechat/events").post(post_event))
        .push(
            Router::with_path("admin")
                .hoop(require_admin_token)
                .push(
                    Router::with_path("portals")
                        .get(list_portals)
                        .post(provision_portal),
                )
                .push(Router::with_path("portals/{id}").get(get_portal))
                .push(Router::with_path("portals/{id}/sync").post(sync_portal))
                .push(
                    Router::with_path("users")
                        .get(list_users)
                        .put(link_user)
                        .delete(unlink_user),
                ),
        )
}

/// Homeserver pushes carry `hs_token`, as a bearer header or the legacy query parameter.
#[handler]
pub async fn require_homeserver_token(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let expected = &web_state().config.bridge.homeserver_token;
    check_token(provided_token(req).as_deref(), expected, res, ctrl);
}

/// Admin endpoints accept the appservice token.
#[handler]
pub async fn require_admin_token(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let expected = &web_state().config.bridge.appservice_token;
    check_token(provided_token(req).as_deref(), expected, res, ctrl);
}

fn check_token(provided: Option<&str>, expected: &str, res: &mut Response, ctrl: &mut FlowCtrl) {
    match provided {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {}
        Some(_) => {
            res.status_code(StatusCode::FORBIDDEN);
            res.render(Json(json!({
                "errcode": "M_FORBIDDEN",
                "error": "bad token",
            })));
            ctrl.skip_rest();
        }
        None => {
            res.status_code(StatusCode::UNAUTHORIZED);
            res.render(Json(json!({
                "errcode": "M_UNAUTHORIZED",
                "error": "missing token",
            })));
            ctrl.skip_rest();
        }
    }
}

fn provided_token(req: &Request) -> Option<String> {
    let header = req.header::<String>("authorization");
    bearer_token(header.as_deref()).or_else(|| req.query::<String>("access_token"))
}

pub(crate) fn bearer_token(header: Option<&str>) -> Option<String> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}
