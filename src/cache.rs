//! Optional Redis read-through cache.
//!
//! The API never depends on Redis being present: when `REDIS_URL` is unset,
//! the initial connection fails, or a command errors, every call degrades to a
//! no-op (`get` returns `None`) and requests are served from MongoDB.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use bson::oid::ObjectId;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub mod ttl {
    use std::time::Duration;

    pub const CARS_LIST: Duration = Duration::from_secs(5 * 60);
    pub const CAR_DETAIL: Duration = Duration::from_secs(10 * 60);
    pub const USER_CARS: Duration = Duration::from_secs(3 * 60);
    pub const FAVORITES: Duration = Duration::from_secs(60);
}

pub mod keys {
    use super::*;

    pub const ALL_CARS_PATTERN: &str = "cars:all:*";

    pub fn all_cars(filters: &impl Serialize) -> String {
        let filters = serde_json::to_string(filters).unwrap_or_default();

        format!("cars:all:{}", general_purpose::STANDARD.encode(filters))
    }

    pub fn car_by_id(id: ObjectId) -> String {
        format!("car:{id}")
    }

    pub fn user_cars(user_id: ObjectId) -> String {
        format!("user:{user_id}:cars")
    }

    pub fn favorites(user_id: ObjectId) -> String {
        format!("favorites:{user_id}")
    }
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    #[cfg(test)]
    Memory(std::sync::Arc<std::sync::Mutex<std::collections::HashMap<String, String>>>),
}

#[derive(Clone)]
pub struct Cache {
    backend: Option<Backend>,
}

impl Cache {
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// Process-local store with the same key semantics; entries never expire.
    #[cfg(test)]
    pub fn memory() -> Self {
        Self {
            backend: Some(Backend::Memory(Default::default())),
        }
    }

    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(redis_url) = redis_url else {
            info!("REDIS_URL not set, running without cache");
            return Self::disabled();
        };

        let client = match redis::Client::open(redis_url) {
            Ok(client) => client,
            Err(err) => {
                warn!("invalid REDIS_URL, caching disabled: {err}");
                return Self::disabled();
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client)).await {
            Ok(Ok(connection)) => {
                info!("redis connected, cache enabled");
                Self {
                    backend: Some(Backend::Redis(connection)),
                }
            }
            Ok(Err(err)) => {
                warn!("redis unavailable, caching disabled: {err}");
                Self::disabled()
            }
            Err(_) => {
                warn!("redis connection timed out, caching disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    async fn get_raw(&self, key: &str) -> Option<String> {
        match self.backend.clone()? {
            Backend::Redis(mut connection) => {
                match connection.get::<_, Option<String>>(key).await {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!("cache get error for {key}: {err}");
                        None
                    }
                }
            }
            #[cfg(test)]
            Backend::Memory(store) => {
                let raw = store.lock().ok()?.get(key).cloned();
                raw
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!("cache hit {key}");
                Some(value)
            }
            Err(err) => {
                warn!("cache decode error for {key}: {err}");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = self.backend.clone() else {
            return;
        };

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("cache encode error for {key}: {err}");
                return;
            }
        };

        match backend {
            Backend::Redis(mut connection) => {
                if let Err(err) = connection
                    .set_ex::<_, _, ()>(key, payload, ttl.as_secs() as usize)
                    .await
                {
                    warn!("cache set error for {key}: {err}");
                }
            }
            #[cfg(test)]
            Backend::Memory(store) => {
                if let Ok(mut store) = store.lock() {
                    store.insert(key.to_string(), payload);
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let Some(backend) = self.backend.clone() else {
            return;
        };

        match backend {
            Backend::Redis(mut connection) => {
                if let Err(err) = connection.del::<_, ()>(key).await {
                    warn!("cache delete error for {key}: {err}");
                }
            }
            #[cfg(test)]
            Backend::Memory(store) => {
                if let Ok(mut store) = store.lock() {
                    store.remove(key);
                }
            }
        }
    }

    /// Deletes every key matching a `KEYS` glob. Only trailing `*` patterns
    /// are used by the API.
    pub async fn delete_pattern(&self, pattern: &str) {
        let Some(backend) = self.backend.clone() else {
            return;
        };

        match backend {
            Backend::Redis(mut connection) => {
                let keys: Vec<String> = match connection.keys::<_, Vec<String>>(pattern).await {
                    Ok(keys) => keys,
                    Err(err) => {
                        warn!("cache pattern lookup error for {pattern}: {err}");
                        return;
                    }
                };

                if keys.is_empty() {
                    return;
                }

                if let Err(err) = connection.del::<_, ()>(keys).await {
                    warn!("cache pattern delete error for {pattern}: {err}");
                }
            }
            #[cfg(test)]
            Backend::Memory(store) => {
                let prefix = pattern.trim_end_matches('*');
                if let Ok(mut store) = store.lock() {
                    store.retain(|key, _| !key.starts_with(prefix));
                }
            }
        }
    }
}
