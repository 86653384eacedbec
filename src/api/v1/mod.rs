pub mod admin;
pub mod admin_auth;
pub mod auth;
pub mod car;
pub mod message;
pub mod rating;
pub mod superadmin_auth;
pub mod token;

#[cfg(test)]
pub mod tests {
    use argon2::Argon2;
    use axum::extract::State;
    use bson::oid::ObjectId;
    use rust_decimal::Decimal;

    use crate::{
        app::AppState,
        cache::Cache,
        config::Config,
        extract::Json,
        util::{hash_password, now},
    };

    use super::{
        admin::{Permission, StaffAccess, StaffRole},
        admin_auth::{AdminCollection, AdminModel, CurrentAdmin, StaffRegisterRequest},
        auth::{CurrentUser, UserAccess, UserCollection, UserModel},
        car::{CarCollection, CarModel, CreateCarRequest, FuelType, Transmission},
        message::MessageCollection,
        rating::RatingCollection,
        superadmin_auth::{CurrentSuperAdmin, SuperAdminCollection},
        token::{Access, AccountType, JwtState},
    };

    const STAFF_PASSWORD: &str = "staffpass";

    #[derive(Clone)]
    pub struct Bootstrap {
        user_model: UserModel,
        user_password: String,
        pub app_state: AppState,
    }

    impl Bootstrap {
        pub fn users(&self) -> State<UserCollection> {
            State(self.app_state.user_collection.clone())
        }

        pub fn cars(&self) -> State<CarCollection> {
            State(self.app_state.car_collection.clone())
        }

        pub fn messages(&self) -> State<MessageCollection> {
            State(self.app_state.message_collection.clone())
        }

        pub fn ratings(&self) -> State<RatingCollection> {
            State(self.app_state.rating_collection.clone())
        }

        pub fn admins(&self) -> State<AdminCollection> {
            State(self.app_state.admin_collection.clone())
        }

        pub fn superadmins(&self) -> State<SuperAdminCollection> {
            State(self.app_state.superadmin_collection.clone())
        }

        pub fn cache(&self) -> State<Cache> {
            State(self.app_state.cache.clone())
        }

        pub fn argon(&self) -> State<Argon2<'static>> {
            State(self.app_state.argon.clone())
        }

        pub fn jwt_state(&self) -> State<JwtState> {
            State(self.app_state.jwt_state.clone())
        }

        pub fn user_access(&self) -> UserAccess {
            let token = super::token::generate_access_token(
                &self.app_state.jwt_state,
                self.user_model.id,
                &self.user_model.email,
                AccountType::User,
            )
            .unwrap();

            UserAccess::from_token(&self.app_state.jwt_state, &token.token).unwrap()
        }

        pub async fn current_user(&self) -> CurrentUser {
            CurrentUser::from_access(&self.user_access(), &self.app_state.user_collection)
                .await
                .unwrap()
        }

        /// Swaps the cache shared by this user and everyone derived from it
        /// afterwards.
        pub fn with_cache(mut self, cache: Cache) -> Self {
            self.app_state.cache = cache;
            self
        }

        pub fn user_model(&self) -> UserModel {
            self.user_model.clone()
        }

        pub fn user_id(&self) -> ObjectId {
            self.user_model.id
        }

        pub fn user_password(&self) -> String {
            self.user_password.clone()
        }

        pub fn staff_password(&self) -> String {
            STAFF_PASSWORD.to_string()
        }

        /// Another user sharing this database.
        pub async fn derive(&self, name: &str, email: &str) -> Bootstrap {
            let user = create_user(&self.app_state, name, email, &self.user_password).await;

            Bootstrap {
                user_model: user,
                user_password: self.user_password.clone(),
                app_state: self.app_state.clone(),
            }
        }

        pub async fn create_car(&self, name: &str) -> CarModel {
            let (_, Json(car)) = super::car::create(
                self.cars(),
                self.users(),
                self.cache(),
                self.current_user().await,
                Json(CreateCarRequest {
                    name: name.to_string(),
                    price: Decimal::from(450_000).into(),
                    photo: None,
                    model_year: 2018,
                    fuel_type: FuelType::Petrol,
                    transmission: Transmission::Manual,
                    kms_driven: 42_000,
                    ownership: 1,
                    seats: 5,
                    description: None,
                }),
            )
            .await
            .unwrap();

            self.app_state
                .car_collection
                .get_one_by_id(*car.id)
                .await
                .unwrap()
                .unwrap()
        }

        pub async fn current_superadmin(&self) -> CurrentSuperAdmin {
            let superadmin = self
                .app_state
                .superadmin_collection
                .find_one(None, None)
                .await
                .unwrap()
                .unwrap();

            CurrentSuperAdmin(superadmin)
        }

        /// The moderator created by `bootstrap()`.
        pub async fn current_admin(&self) -> CurrentAdmin {
            let admin = self
                .app_state
                .admin_collection
                .find_one(bson::doc! { "email": "moderator@example.com" }, None)
                .await
                .unwrap()
                .unwrap();

            CurrentAdmin(admin)
        }

        pub async fn staff_access(&self) -> StaffAccess {
            let admin = self.current_admin().await.0;

            StaffAccess::from_access(
                Access {
                    id: admin.id,
                    email: admin.email,
                    account_type: AccountType::Admin,
                },
                &self.app_state.admin_collection,
                &self.app_state.superadmin_collection,
            )
            .await
            .unwrap()
        }
    }

    pub async fn create_user(app: &AppState, name: &str, email: &str, password: &str) -> UserModel {
        super::auth::create_user(
            &app.user_collection,
            &app.argon,
            super::auth::RegisterRequest {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                phone: Some("9876543210".to_string()),
            },
        )
        .await
        .unwrap()
    }

    async fn create_staff(app: &AppState) {
        let superadmin = super::superadmin_auth::create_superadmin(
            &app.superadmin_collection,
            &app.argon,
            StaffRegisterRequest {
                name: "Root Admin".to_string(),
                email: "root@example.com".to_string(),
                password: STAFF_PASSWORD.to_string(),
            },
        )
        .await
        .unwrap();

        app.admin_collection
            .insert_one(
                AdminModel {
                    id: ObjectId::new(),
                    name: "Moderator".to_string(),
                    email: "moderator@example.com".to_string(),
                    password: hash_password(&app.argon, STAFF_PASSWORD).unwrap(),
                    role: StaffRole::Moderator,
                    permissions: Permission::moderator_defaults(),
                    created_by: superadmin.id,
                    is_active: true,
                    last_login: None,
                    created_at: now(),
                    updated_at: now(),
                },
                None,
            )
            .await
            .unwrap();
    }

    /// A fresh database with one user, one superadmin and one moderator.
    pub async fn bootstrap() -> Bootstrap {
        dotenvy::dotenv().ok();
        let mongodb_uri = std::env::var("MONGODB_URI")
            .expect("MONGODB_URI must be set to run database tests");

        let config = Config {
            port: 0,
            mongodb_uri,
            database_name: format!("carwise-test-{}", ObjectId::new()),
            jwt_secret: "test-secret".to_string(),
            redis_url: None,
        };

        let app_state = AppState::with_cache(&config, Cache::disabled())
            .await
            .unwrap();
        app_state.run_migration().await.unwrap();

        let password = "password1";
        let user = create_user(&app_state, "Seller Person", "seller@example.com", password).await;
        create_staff(&app_state).await;

        Bootstrap {
            user_model: user,
            user_password: password.to_string(),
            app_state,
        }
    }
}
