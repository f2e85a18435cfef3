pub mod handlers;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::routing::{any, get};
use axum::Router;
use tracing::info;

use crate::pipeline::{Pipeline, Services};

pub struct AppState {
    pub services: Services,
}

/// 每条流水线挂在自己的路径上，另加 `/health`
pub fn router(state: Arc<AppState>, pipelines: Vec<Pipeline>) -> Router {
    let mut router = Router::new().route("/health", get(handlers::health));

    for pipeline in pipelines {
        info!(name = pipeline.name(), route = pipeline.route(), "mounting pipeline");
        let route = pipeline.route().to_string();
        let pipeline = Arc::new(pipeline);
        router = router.route(
            &route,
            any(move |State(state): State<Arc<AppState>>, request: Request| {
                let pipeline = Arc::clone(&pipeline);
                async move { handlers::handle_pipeline(state, pipeline, request).await }
            }),
        );
    }

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::pipeline::testing::services;
    use crate::pipeline::Registries;
    use crate::repository::fixtures::row;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    const ROUTES: &str = r#"
        [[routes]]
        name = "web"
        route = "/ad"
        input = { name = "web" }
        stages = [{ name = "cache" }, { name = "rotation" }]
        formats = [{ name = "json" }]
        output = { name = "json" }

        [[routes]]
        name = "rtb"
        route = "/rtb"
        input = { name = "rtb" }
        stages = [{ name = "cache" }, { name = "rotation" }]
        formats = [{ name = "html", config = { base_url = "https://tk.example.com" } }]
        output = { name = "rtb" }
    "#;

    #[derive(serde::Deserialize)]
    struct Routes {
        routes: Vec<RouteConfig>,
    }

    async fn app() -> Router {
        let (services, _, _) = services(vec![row(1, 100), row(2, 300)]).await;
        let routes: Routes = toml::from_str(ROUTES).expect("valid routes");
        let pipelines = Registries::default().build_all(&routes.routes).expect("valid pipelines");
        router(Arc::new(AppState { services }), pipelines)
    }

    async fn json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_cache_state() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        let health = json(response).await;
        assert_eq!(health["cache"], "populated");
        assert_eq!(health["banners"], 2);
        assert!(health["refreshed_at"].is_string());
    }

    #[tokio::test]
    async fn web_route_answers_get_with_query() {
        let response = app()
            .await
            .oneshot(Request::get("/ad?count=2&uid=u1").body(Body::empty()).expect("request"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn rtb_route_reads_posted_body() {
        let body = r#"{"id":"req-1","imp":[{"id":"1","banner":{"w":300,"h":250}}]}"#;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/rtb")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request");
        let response = app().await.oneshot(request).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);

        let bid = json(response).await;
        assert_eq!(bid["id"], "req-1");
        assert_eq!(bid["seatbid"][0]["bid"][0]["impid"], "1");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = app()
            .await
            .oneshot(Request::get("/nope").body(Body::empty()).expect("request"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
