use salvo::prelude::*;
use serde_json::json;
use tracing::info;

use crate::bridge::BridgeError;
use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

fn render_bridge_error(res: &mut Response, err: &BridgeError) {
    let status = match err {
        BridgeError::PermanentRejection(_) | BridgeError::InvalidTransition { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BridgeError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    render_error(res, status, &err.to_string());
}

fn required_query(req: &Request, name: &str) -> Option<String> {
    req.query::<String>(name).filter(|value| !value.is_empty())
}

#[handler]
pub async fn list_portals(req: &mut Request, res: &mut Response) {
    let limit = req.query::<i64>("limit").unwrap_or(100).clamp(1, 1000);
    let offset = req.query::<i64>("offset").unwrap_or(0).max(0);

    let identity = &web_state().orchestrator.context().identity;
    match identity.list_portals(limit, offset).await {
        Ok(portals) => {
            res.render(Json(json!({
                "portals": portals,
                "count": portals.len(),
                "limit": limit,
                "offset": offset,
            })));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
        }
    }
}

#[handler]
pub async fn get_portal(req: &mut Request, res: &mut Response) {
    let id = match req.param::<i64>("id") {
        Some(v) if v > 0 => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid portal id");
            return;
        }
    };

    let identity = &web_state().orchestrator.context().identity;
    match identity.load_portal(id).await {
        Ok(Some(portal)) => res.render(Json(json!({ "portal": portal }))),
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "portal not found"),
        Err(err) => render_error(
            res,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("database error: {}", err),
        ),
    }
}

/// Bridges a Google Chat space, onto `matrix_room_id` when given.
#[handler]
pub async fn provision_portal(req: &mut Request, res: &mut Response) {
    let Some(space) = required_query(req, "remote_conversation_id") else {
        render_error(
            res,
            StatusCode::BAD_REQUEST,
            "missing remote_conversation_id query parameter",
        );
        return;
    };
    if !space.starts_with("spaces/") {
        render_error(
            res,
            StatusCode::BAD_REQUEST,
            "remote_conversation_id must look like spaces/<id>",
        );
        return;
    }
    let room_id = required_query(req, "matrix_room_id");

    let state = web_state();
    if let Some(room_id) = &room_id {
        match state
            .orchestrator
            .context()
            .identity
            .portal_by_local_room(room_id)
            .await
        {
            Ok(Some(existing)) if existing.remote_conversation_id != space => {
                render_error(res, StatusCode::CONFLICT, "matrix room is already bridged");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                render_error(
                    res,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("database error: {}", err),
                );
                return;
            }
        }
    }

    match state.orchestrator.initialize_portal(&space, room_id).await {
        Ok(room_id) => {
            info!("provisioned portal space={} room_id={}", space, room_id);
            res.status_code(StatusCode::CREATED);
            res.render(Json(json!({
                "ok": true,
                "remote_conversation_id": space,
                "matrix_room_id": room_id,
            })));
        }
        Err(err) => render_bridge_error(res, &err),
    }
}

#[handler]
pub async fn sync_portal(req: &mut Request, res: &mut Response) {
    let id = match req.param::<i64>("id") {
        Some(v) if v > 0 => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid portal id");
            return;
        }
    };

    let orchestrator = &web_state().orchestrator;
    let portal = match orchestrator.context().identity.load_portal(id).await {
        Ok(Some(portal)) => portal,
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "portal not found");
            return;
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    };

    match orchestrator
        .request_metadata_sync(&portal.remote_conversation_id)
        .await
    {
        Ok(true) => {
            res.status_code(StatusCode::ACCEPTED);
            res.render(Json(json!({ "ok": true, "id": id })));
        }
        Ok(false) => render_error(res, StatusCode::NOT_FOUND, "portal not found"),
        Err(err) => render_bridge_error(res, &err),
    }
}

#[handler]
pub async fn list_users(res: &mut Response) {
    let identity = &web_state().orchestrator.context().identity;
    match identity.list_users().await {
        Ok(users) => res.render(Json(json!({ "users": users, "count": users.len() }))),
        Err(err) => render_error(
            res,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("database error: {}", err),
        ),
    }
}

/// Links a Matrix user to a Google account so both directions use the real identity.
#[handler]
pub async fn link_user(req: &mut Request, res: &mut Response) {
    let (Some(matrix_user_id), Some(google_user_id), Some(access_token)) = (
        required_query(req, "matrix_user_id"),
        required_query(req, "google_user_id"),
        required_query(req, "access_token"),
    ) else {
        render_error(
            res,
            StatusCode::BAD_REQUEST,
            "matrix_user_id, google_user_id and access_token are required",
        );
        return;
    };
    if !matrix_user_id.starts_with('@') || !google_user_id.starts_with("users/") {
        render_error(res, StatusCode::BAD_REQUEST, "malformed user id");
        return;
    }

    let ctx = web_state().orchestrator.context();
    match ctx.identity.user_for_google(&google_user_id).await {
        Ok(Some(owner)) if owner.matrix_user_id != matrix_user_id => {
            render_error(
                res,
                StatusCode::CONFLICT,
                "google account is already linked to another matrix user",
            );
            return;
        }
        Ok(_) => {}
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    }

    match ctx
        .puppets
        .link_user(&matrix_user_id, &google_user_id, &access_token)
        .await
    {
        Ok(user) => {
            info!(
                "linked matrix_user_id={} google_user_id={}",
                matrix_user_id, google_user_id
            );
            res.render(Json(json!({ "ok": true, "user": user })));
        }
        Err(err) => render_bridge_error(res, &err),
    }
}

#[handler]
pub async fn unlink_user(req: &mut Request, res: &mut Response) {
    let Some(matrix_user_id) = required_query(req, "matrix_user_id") else {
        render_error(
            res,
            StatusCode::BAD_REQUEST,
            "missing matrix_user_id query parameter",
        );
        return;
    };

    let puppets = &web_state().orchestrator.context().puppets;
    match puppets.unlink_user(&matrix_user_id).await {
        Ok(true) => res.render(Json(json!({ "ok": true }))),
        Ok(false) => render_error(res, StatusCode::NOT_FOUND, "user is not linked"),
        Err(err) => render_bridge_error(res, &err),
    }
}
