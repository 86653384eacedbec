use axum::{extract::FromRef, http::Uri, routing, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    api::v1::{
        admin,
        admin_auth::{self, AdminCollection},
        auth::{self, UserCollection},
        car::{self, CarCollection},
        message::{self, MessageCollection},
        rating::{self, RatingCollection},
        superadmin_auth::{self, SuperAdminCollection},
        token::JwtState,
    },
    cache::Cache,
    config::Config,
    error::Error,
    migrate::MigrationCollection,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub cache: Cache,

    pub mongo_client: mongodb::Client,
    pub migration_collection: MigrationCollection,
    pub user_collection: UserCollection,
    pub car_collection: CarCollection,
    pub message_collection: MessageCollection,
    pub rating_collection: RatingCollection,
    pub admin_collection: AdminCollection,
    pub superadmin_collection: SuperAdminCollection,
}

impl AppState {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let cache = Cache::connect(config.redis_url.as_deref()).await;

        Self::with_cache(config, cache).await
    }

    pub async fn with_cache(config: &Config, cache: Cache) -> Result<Self, Error> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::new(&config.jwt_secret);

        let mongo_client_opt = mongodb::options::ClientOptions::parse(&config.mongodb_uri).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(&config.database_name);
        Ok(Self {
            argon,
            jwt_state,
            cache,

            mongo_client,
            migration_collection: MigrationCollection(db.collection("migrations").into()),
            user_collection: UserCollection(db.collection("users").into()),
            car_collection: CarCollection(db.collection("cars").into()),
            message_collection: MessageCollection(db.collection("messages").into()),
            rating_collection: RatingCollection(db.collection("ratings").into()),
            admin_collection: AdminCollection(db.collection("admins").into()),
            superadmin_collection: SuperAdminCollection(db.collection("superadmins").into()),
        })
    }
}

pub fn router(app_state: AppState) -> Router {
    let api = Router::new()
        .nest(
            "/auth",
            Router::new()
                .route("/register", routing::post(auth::register))
                .route("/login", routing::post(auth::login))
                .route(
                    "/profile",
                    routing::get(auth::profile).put(auth::update_profile),
                )
                .route("/delete", routing::delete(auth::delete_account)),
        )
        .nest(
            "/cars",
            Router::new()
                .route("/", routing::get(car::index).post(car::create))
                .route("/mine", routing::get(car::mine))
                .route("/favorites", routing::get(car::favorites))
                .route(
                    "/:id",
                    routing::get(car::show).put(car::update).delete(car::delete),
                )
                .route(
                    "/:id/favorite",
                    routing::post(car::favorite).delete(car::unfavorite),
                ),
        )
        .nest(
            "/messages",
            Router::new()
                .route("/send", routing::post(message::send))
                .route(
                    "/conversation/:other_user_id/:car_id",
                    routing::get(message::conversation),
                )
                .route("/conversations", routing::get(message::conversations))
                .route("/unread-count", routing::get(message::unread_count))
                .route("/:message_id/read", routing::put(message::mark_as_read))
                .route("/:message_id", routing::delete(message::delete))
                .route(
                    "/car/:car_id/inquiries",
                    routing::get(message::car_inquiries),
                ),
        )
        .nest(
            "/ratings",
            Router::new()
                .route("/user/:user_id", routing::get(rating::user_ratings))
                .route("/average/:user_id", routing::get(rating::average))
                .route("/create", routing::post(rating::create))
                .route("/can-rate/:user_id/:car_id", routing::get(rating::can_rate))
                .route("/:rating_id", routing::delete(rating::delete)),
        )
        .nest(
            "/admin",
            Router::new()
                .route("/users", routing::get(admin::users))
                .route("/users/:id/suspend", routing::put(admin::suspend_user))
                .route("/users/:id/unsuspend", routing::put(admin::unsuspend_user))
                .route(
                    "/users/:id/permanent",
                    routing::delete(admin::delete_user_permanently),
                )
                .route("/cars", routing::get(admin::cars))
                .route("/cars/:id/remove", routing::put(admin::remove_car))
                .route("/cars/:id/restore", routing::put(admin::restore_car))
                .route(
                    "/cars/:id/permanent",
                    routing::delete(admin::delete_car_permanently),
                )
                .route("/analytics", routing::get(admin::analytics)),
        )
        .nest(
            "/admin-auth",
            Router::new()
                .route("/login", routing::post(admin_auth::login))
                .route("/register", routing::post(admin_auth::register))
                .route("/all", routing::get(admin_auth::all))
                .route("/me", routing::get(admin_auth::me))
                .route("/change-password", routing::put(admin_auth::change_password))
                .route("/:admin_id", routing::delete(admin_auth::disable))
                .route(
                    "/:admin_id/permanent",
                    routing::delete(admin_auth::delete_permanently),
                )
                .route("/:admin_id/restore", routing::put(admin_auth::restore)),
        )
        .nest(
            "/superadmin-auth",
            Router::new()
                .route("/register", routing::post(superadmin_auth::register))
                .route("/login", routing::post(superadmin_auth::login))
                .route("/me", routing::get(superadmin_auth::me))
                .route(
                    "/change-password",
                    routing::put(superadmin_auth::change_password),
                ),
        );

    Router::new()
        .route("/", routing::get(|| async { "Used Car Platform API running" }))
        .nest("/api", api)
        .fallback(|uri: Uri| async move { Error::NotFound(uri) })
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::{cache::Cache, config::Config};

    use super::{router, AppState};

    fn config() -> Config {
        Config {
            port: 5000,
            // the driver connects lazily, so no server is needed to build the state
            mongodb_uri: "mongodb://localhost:27017".to_string(),
            database_name: "carwise-router-test".to_string(),
            jwt_secret: "router-test-secret".to_string(),
            redis_url: None,
        }
    }

    async fn app() -> axum::Router {
        let state = AppState::with_cache(&config(), Cache::disabled())
            .await
            .unwrap();

        router(state)
    }

    #[tokio::test]
    async fn test_banner() {
        let response = app()
            .await
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"Used Car Platform API running");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = app()
            .await
            .oneshot(Request::get("/api/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_protected_route_needs_token() {
        let response = app()
            .await
            .oneshot(
                Request::get("/api/auth/profile")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_user_token_on_staff_route_is_forbidden() {
        let state = AppState::with_cache(&config(), Cache::disabled())
            .await
            .unwrap();
        let token = crate::api::v1::token::generate_access_token(
            &state.jwt_state,
            bson::oid::ObjectId::new(),
            "asha@example.com",
            crate::api::v1::token::AccountType::User,
        )
        .unwrap()
        .token;

        let response = router(state)
            .oneshot(
                Request::get("/api/admin/users")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    async fn post_register(body: &'static str) -> (StatusCode, serde_json::Value) {
        let response = app()
            .await
            .oneshot(
                Request::post("/api/auth/register")
                    .header("Content-Type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_bad_json_body_is_json_400() {
        let (status, json) = post_register(r#"{"name":"Asha Rao","email":"a@b.com"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["type"], "BadRequest");
        assert!(json["message"].as_str().unwrap().contains("password"));

        let (status, json) = post_register("{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["type"], "BadRequest");
    }

    #[tokio::test]
    async fn test_bad_query_is_json_400() {
        let response = app()
            .await
            .oneshot(
                Request::get("/api/cars?fuel_type=Steam")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["type"], "BadRequest");
    }
}
