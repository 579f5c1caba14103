use std::sync::Arc;

use chrono::Utc;
use recast_common::Database;
use tokio::sync::watch;
use uuid::Uuid;

use super::Facade;
use crate::errors::RecastError;
use crate::models::Profile;

#[derive(Clone)]
pub struct ProfileFacade {
    facade: Facade<Profile>,
}

impl ProfileFacade {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            facade: Facade::new(db),
        }
    }

    pub fn facade(&self) -> &Facade<Profile> {
        &self.facade
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Profile>> {
        self.facade.subscribe()
    }

    /// Profile of the signed-in user. Without a known user id, row-level
    /// security leaves exactly one visible row, which is used instead.
    pub fn current(&self, user_id: Option<Uuid>) -> Option<Profile> {
        match user_id {
            Some(id) => self.facade.by_id(id),
            None => {
                let rows = self.facade.snapshot();
                match rows.as_slice() {
                    [only] => Some(only.clone()),
                    _ => None,
                }
            }
        }
    }

    /// Save with `updated_at` set to now.
    pub async fn save(&self, profile: &Profile) -> Result<Profile, RecastError> {
        let stamped = Profile {
            updated_at: Some(Utc::now()),
            ..profile.clone()
        };
        self.facade.upsert(&stamped, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recast_common::Table;
    use recast_common::memory::MemoryBackend;
    use serde_json::json;

    const USER: &str = "6f1c1c36-8a52-4a53-9d7b-0b7e6b0a9d11";

    #[tokio::test]
    async fn current_prefers_user_id() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Profiles, vec![json!({"id": USER, "username": "ada"})]);
        let profiles = ProfileFacade::new(db);
        profiles.facade().load().await;

        let user = Uuid::parse_str(USER).unwrap();
        assert_eq!(profiles.current(Some(user)).unwrap().username.as_deref(), Some("ada"));
        assert!(profiles.current(Some(Uuid::nil())).is_none());
        assert_eq!(profiles.current(None).unwrap().id, user);
    }

    #[tokio::test]
    async fn save_stamps_updated_at() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Profiles, vec![json!({"id": USER, "username": "ada"})]);
        let profiles = ProfileFacade::new(db.clone());
        profiles.facade().load().await;

        let before = Utc::now();
        let mut profile = profiles.current(None).unwrap();
        profile.full_name = Some("Ada Lovelace".into());
        let saved = profiles.save(&profile).await.unwrap();

        assert!(saved.updated_at.unwrap() >= before);
        assert_eq!(saved.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(db.rows(Table::Profiles).len(), 1);
    }
}
