use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let state = web_state();
    let identity = &state.orchestrator.context().identity;
    let portals = match identity.count_portals().await {
        Ok(count) => json!(count),
        Err(err) => json!({ "error": err.to_string() }),
    };

    res.render(Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "database": identity.database().backend_name(),
        "portals": portals,
        "portal_workers": state.orchestrator.worker_count(),
    })));
}
