//! Realtime-synced entity caches.
//!
//! Every service wraps a `Facade<T>`: a `watch` channel holding the latest
//! collection for one table, seeded by a bulk load whenever a session becomes
//! available and kept current by the table's realtime channel.
//!
//! | Module             | Service                 | Table               |
//! |--------------------|-------------------------|---------------------|
//! | `process`          | `ProcessFacade`         | `Processes`         |
//! | `step`             | `StepFacade`            | `Steps`             |
//! | `step_property`    | `StepPropertyFacade`    | `StepProperties`    |
//! | `element`          | `ElementFacade`         | `Elements`          |
//! | `element_property` | `ElementPropertyFacade` | `ElementProperties` |
//! | `profile`          | `ProfileFacade`         | `Profiles`          |
//! | `bundle`           | `BundleFacade`          | `Bundles`           |
//!
//! `Facades` owns all of them plus the view-model service and their tasks.

pub mod bundle;
pub mod element;
pub mod element_property;
pub mod process;
pub mod profile;
pub mod step;
pub mod step_property;

pub use bundle::BundleFacade;
pub use element::ElementFacade;
pub use element_property::ElementPropertyFacade;
pub use process::ProcessFacade;
pub use profile::ProfileFacade;
pub use step::StepFacade;
pub use step_property::StepPropertyFacade;

use std::sync::Arc;

use recast_common::rest::decode_rows;
use recast_common::{
    BackendError, ChangeFeed, ChannelConfig, Database, PostgresChange, RowChange, RowFilter,
    Session, Subscription,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::RecastError;
use crate::models::Entity;
use crate::view_model::ViewModelService;

/// Merge one change into `rows`. Returns whether anything changed.
///
/// Inserts and updates both replace the row with the same id or append it,
/// so a saved row followed by its realtime echo is never duplicated.
pub fn merge<T: Entity>(rows: &mut Vec<T>, change: RowChange<T>) -> bool {
    match change {
        RowChange::Insert(row) | RowChange::Update(row) => upsert_row(rows, row),
        RowChange::Delete(old) => {
            let id = old
                .get("id")
                .cloned()
                .and_then(|id| serde_json::from_value::<T::Id>(id).ok());
            match id {
                Some(id) => remove_row(rows, id),
                None => {
                    tracing::warn!(table = %T::TABLE, "delete event without id");
                    false
                }
            }
        }
    }
}

fn upsert_row<T: Entity>(rows: &mut Vec<T>, row: T) -> bool {
    let existing = row
        .id()
        .and_then(|id| rows.iter().position(|r| r.id() == Some(id)));
    match existing {
        Some(idx) if rows[idx] == row => false,
        Some(idx) => {
            rows[idx] = row;
            true
        }
        None => {
            rows.push(row);
            true
        }
    }
}

fn remove_row<T: Entity>(rows: &mut Vec<T>, id: T::Id) -> bool {
    let before = rows.len();
    rows.retain(|r| r.id() != Some(id));
    rows.len() != before
}

/// Cached, realtime-synced collection of one entity type.
pub struct Facade<T: Entity> {
    db: Arc<dyn Database>,
    state: Arc<watch::Sender<Vec<T>>>,
}

impl<T: Entity> Clone for Facade<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Entity> Facade<T> {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let (state, _) = watch::channel(Vec::new());
        Self {
            db,
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<T>> {
        self.state.subscribe()
    }

    pub fn by_id(&self, id: T::Id) -> Option<T> {
        self.find(|row| row.id() == Some(id))
    }

    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.state.borrow().iter().find(|row| pred(row)).cloned()
    }

    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.state
            .borrow()
            .iter()
            .filter(|row| pred(row))
            .cloned()
            .collect()
    }

    /// Replace the whole collection. Subscribers are only notified when it differs.
    pub fn replace_all(&self, rows: Vec<T>) -> bool {
        self.state.send_if_modified(|current| {
            if *current == rows {
                return false;
            }
            *current = rows;
            true
        })
    }

    pub fn apply(&self, change: RowChange<T>) -> bool {
        self.state.send_if_modified(|rows| merge(rows, change))
    }

    /// Decode and merge a raw realtime change.
    pub fn apply_change(&self, change: &PostgresChange) -> bool {
        match change.decode::<T>() {
            Ok(change) => self.apply(change),
            Err(e) => {
                tracing::warn!(table = %T::TABLE, error = %e, "dropping undecodable change");
                false
            }
        }
    }

    /// Bulk-load every row. Failures leave an empty collection.
    pub async fn load(&self) -> Vec<T> {
        let rows = match self.fetch().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(table = %T::TABLE, error = %e, "load failed, using empty collection");
                Vec::new()
            }
        };
        tracing::debug!(table = %T::TABLE, rows = rows.len(), "loaded");
        self.replace_all(rows.clone());
        rows
    }

    async fn fetch(&self) -> Result<Vec<T>, BackendError> {
        let rows = self.db.select(T::TABLE, &[]).await?;
        decode_rows(T::TABLE, rows)
    }

    /// Upsert one row and merge the stored representation into the cache.
    pub async fn upsert(&self, row: &T, on_conflict: Option<&str>) -> Result<T, RecastError> {
        match self.try_upsert(row, on_conflict).await {
            Ok(stored) => {
                self.apply(RowChange::Update(stored.clone()));
                Ok(stored)
            }
            Err(e) => {
                tracing::error!(table = %T::TABLE, error = %e, "upsert failed");
                Err(e)
            }
        }
    }

    async fn try_upsert(&self, row: &T, on_conflict: Option<&str>) -> Result<T, RecastError> {
        let body = serde_json::to_value(row)
            .map_err(|e| BackendError::decode(format!("{} row", T::TABLE), e))?;
        let stored = self.db.upsert(T::TABLE, body, on_conflict).await?;
        let stored: Vec<T> = decode_rows(T::TABLE, stored)?;
        stored.into_iter().next().ok_or_else(|| {
            RecastError::Other(anyhow::anyhow!(
                "upsert into {} returned no rows",
                T::TABLE
            ))
        })
    }

    /// Delete by id on the server, then drop the row locally.
    pub async fn delete(&self, id: T::Id) -> Result<(), RecastError> {
        let result = self.db.delete(T::TABLE, &[RowFilter::eq("id", id)]).await;
        match result {
            Ok(()) => {
                self.state.send_if_modified(|rows| remove_row(rows, id));
                Ok(())
            }
            Err(e) => {
                tracing::error!(table = %T::TABLE, %id, error = %e, "delete failed");
                Err(e.into())
            }
        }
    }

    /// Reload on every sign-in and merge realtime changes until aborted.
    /// Without a realtime channel the facade stays load-only.
    pub fn spawn_sync(
        &self,
        mut sessions: watch::Receiver<Option<Session>>,
        feed: Arc<dyn ChangeFeed>,
    ) -> JoinHandle<()> {
        let facade = self.clone();
        tokio::spawn(async move {
            let channel = ChannelConfig::new(T::CHANNEL).on(T::binding());
            let mut subscription = match feed.subscribe(channel).await {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    tracing::warn!(table = %T::TABLE, error = %e, "realtime unavailable, load-only");
                    None
                }
            };

            let signed_in = sessions.borrow_and_update().is_some();
            if signed_in {
                facade.load().await;
            }

            let mut sessions_open = true;
            loop {
                tokio::select! {
                    changed = sessions.changed(), if sessions_open => {
                        if changed.is_err() {
                            sessions_open = false;
                            if subscription.is_none() {
                                break;
                            }
                            continue;
                        }
                        let signed_in = sessions.borrow_and_update().is_some();
                        if signed_in {
                            facade.load().await;
                        }
                    }
                    change = next_change(&mut subscription) => match change {
                        Some(change) => {
                            facade.apply_change(&change);
                        }
                        None => {
                            tracing::warn!(table = %T::TABLE, "realtime channel closed");
                            subscription = None;
                            if !sessions_open {
                                break;
                            }
                        }
                    },
                }
            }
        })
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<PostgresChange> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// All entity services and the view-model service, wired to one backend.
pub struct Facades {
    pub processes: ProcessFacade,
    pub steps: StepFacade,
    pub step_properties: StepPropertyFacade,
    pub elements: ElementFacade,
    pub element_properties: ElementPropertyFacade,
    pub profiles: ProfileFacade,
    pub bundles: BundleFacade,
    pub view_models: ViewModelService,
    feed: Arc<dyn ChangeFeed>,
    tasks: Vec<JoinHandle<()>>,
}

impl Facades {
    pub fn new(db: Arc<dyn Database>, feed: Arc<dyn ChangeFeed>) -> Self {
        let processes = ProcessFacade::new(Arc::clone(&db));
        let steps = StepFacade::new(Arc::clone(&db));
        let step_properties = StepPropertyFacade::new(Arc::clone(&db), steps.clone());
        let element_properties = ElementPropertyFacade::new(Arc::clone(&db));
        let elements = ElementFacade::new(
            Arc::clone(&db),
            element_properties.clone(),
            processes.clone(),
            steps.clone(),
            step_properties.clone(),
        );
        let profiles = ProfileFacade::new(Arc::clone(&db));
        let bundles = BundleFacade::new(
            db,
            processes.clone(),
            steps.clone(),
            step_properties.clone(),
        );
        let view_models = ViewModelService::new(elements.clone());

        Self {
            processes,
            steps,
            step_properties,
            elements,
            element_properties,
            profiles,
            bundles,
            view_models,
            feed,
            tasks: Vec::new(),
        }
    }

    /// Spawn every sync task and the view-model task.
    pub fn start(&mut self, sessions: watch::Receiver<Option<Session>>) {
        if !self.tasks.is_empty() {
            return;
        }
        let feed = &self.feed;
        self.tasks = vec![
            self.processes.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.steps.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.step_properties.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.elements.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.element_properties.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.profiles.facade().spawn_sync(sessions.clone(), Arc::clone(feed)),
            self.bundles.facade().spawn_sync(sessions, Arc::clone(feed)),
            self.view_models.spawn(),
        ];
        tracing::debug!(tasks = self.tasks.len(), "facades started");
    }

    /// Load every table once and recompute the view models.
    pub async fn refresh(&self) {
        tokio::join!(
            self.processes.facade().load(),
            self.steps.facade().load(),
            self.step_properties.facade().load(),
            self.elements.facade().load(),
            self.element_properties.facade().load(),
            self.profiles.facade().load(),
            self.bundles.facade().load(),
        );
        self.view_models.recompute();
    }

    /// Abort all tasks. Their subscriptions unsubscribe when dropped.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }
}

impl Drop for Facades {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Element, Process};
    use recast_common::memory::MemoryBackend;
    use recast_common::Table;
    use serde_json::json;
    use std::time::Duration;

    fn element(id: i64, name: &str) -> Element {
        Element {
            id: Some(id),
            name: name.to_string(),
            process_id: 1,
            current_step_id: Some(10),
        }
    }

    #[test]
    fn insert_appends_new_row() {
        let mut rows = vec![element(1, "a")];
        assert!(merge(&mut rows, RowChange::Insert(element(2, "b"))));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.id == Some(2)).count(), 1);
    }

    #[test]
    fn insert_of_known_id_replaces() {
        let mut rows = vec![element(1, "a")];
        assert!(merge(&mut rows, RowChange::Insert(element(1, "renamed"))));
        assert_eq!(rows, vec![element(1, "renamed")]);
    }

    #[test]
    fn identical_echo_is_not_a_change() {
        let mut rows = vec![element(1, "a")];
        assert!(!merge(&mut rows, RowChange::Insert(element(1, "a"))));
        assert!(!merge(&mut rows, RowChange::Update(element(1, "a"))));
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn update_replaces_only_matching_row() {
        let mut rows = vec![element(1, "a"), element(2, "b"), element(3, "c")];
        assert!(merge(&mut rows, RowChange::Update(element(2, "B"))));
        assert_eq!(rows, vec![element(1, "a"), element(2, "B"), element(3, "c")]);
    }

    #[test]
    fn update_of_unknown_id_appends() {
        let mut rows = vec![element(1, "a")];
        assert!(merge(&mut rows, RowChange::Update(element(9, "z"))));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn delete_removes_exactly_one_row() {
        let mut rows = vec![element(1, "a"), element(2, "b")];
        assert!(merge(&mut rows, RowChange::Delete(json!({"id": 1}))));
        assert_eq!(rows, vec![element(2, "b")]);
        assert!(!merge(&mut rows, RowChange::Delete(json!({"id": 1}))));
        assert!(!merge(&mut rows, RowChange::Delete(json!({}))));
    }

    fn session() -> Session {
        Session {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            expires_at: None,
            user: None,
        }
    }

    fn signed_in() -> watch::Sender<Option<Session>> {
        watch::channel(Some(session())).0
    }

    async fn wait_until<T: Entity>(facade: &Facade<T>, pred: impl Fn(&[T]) -> bool) {
        let mut rx = facade.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("facade never reached expected state");
    }

    #[tokio::test]
    async fn load_failure_degrades_to_empty() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Processes, vec![json!({"id": 1, "name": "P"})]);
        let facade: Facade<Process> = Facade::new(db.clone());
        assert_eq!(facade.load().await.len(), 1);

        db.set_failing(true);
        assert!(facade.load().await.is_empty());
        assert!(facade.snapshot().is_empty());
    }

    #[tokio::test]
    async fn undecodable_rows_degrade_to_empty() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Elements, vec![json!({"id": 1, "title": "no name"})]);
        let facade: Facade<Element> = Facade::new(db);
        assert!(facade.load().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_followed_by_echo_is_not_duplicated() {
        let db = Arc::new(MemoryBackend::new());
        let facade: Facade<Element> = Facade::new(db.clone());
        let sessions = signed_in();
        let task = facade.spawn_sync(sessions.subscribe(), db.clone());
        tokio::time::timeout(Duration::from_secs(2), async {
            while db.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stored = facade
            .upsert(&Element::new("E", 1, Some(10)), None)
            .await
            .unwrap();
        assert!(stored.id.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(facade.snapshot(), vec![stored]);
        task.abort();
    }

    #[tokio::test]
    async fn realtime_changes_reach_the_cache() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(
            Table::Elements,
            vec![json!({"id": 1, "name": "a", "process_id": 1}), json!({"id": 2, "name": "b", "process_id": 1})],
        );
        let facade: Facade<Element> = Facade::new(db.clone());
        let sessions = signed_in();
        let task = facade.spawn_sync(sessions.subscribe(), db.clone());
        wait_until(&facade, |rows| rows.len() == 2).await;

        db.write_external(Table::Elements, json!({"name": "c", "process_id": 1}));
        wait_until(&facade, |rows| rows.len() == 3).await;

        db.write_external(Table::Elements, json!({"id": 1, "name": "A"}));
        wait_until(&facade, |rows| rows.iter().any(|r| r.name == "A")).await;
        assert_eq!(facade.snapshot().len(), 3);

        db.delete_external(Table::Elements, 2);
        wait_until(&facade, |rows| rows.len() == 2).await;
        assert!(facade.by_id(2).is_none());
        task.abort();
    }

    #[tokio::test]
    async fn load_waits_for_a_session() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Processes, vec![json!({"id": 1, "name": "P"})]);
        let facade: Facade<Process> = Facade::new(db.clone());
        let (sessions, _) = watch::channel(None);
        let task = facade.spawn_sync(sessions.subscribe(), db.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(facade.snapshot().is_empty());

        sessions.send_replace(Some(session()));
        wait_until(&facade, |rows| rows.len() == 1).await;
        task.abort();
    }

    #[tokio::test]
    async fn write_errors_are_returned() {
        let db = Arc::new(MemoryBackend::new());
        let facade: Facade<Process> = Facade::new(db.clone());
        db.set_failing(true);
        let err = facade.upsert(&Process::new("P", None), None).await.unwrap_err();
        assert!(matches!(err, RecastError::Database(BackendError::Status { status: 503, .. })));
        assert!(facade.delete(1).await.is_err());
        assert!(facade.snapshot().is_empty());
    }

    #[tokio::test]
    async fn delete_drops_row_locally() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Processes, vec![json!({"id": 1, "name": "P"}), json!({"id": 2, "name": "Q"})]);
        let facade: Facade<Process> = Facade::new(db.clone());
        facade.load().await;
        facade.delete(1).await.unwrap();
        assert_eq!(facade.snapshot().len(), 1);
        assert_eq!(db.rows(Table::Processes).len(), 1);
    }

    #[tokio::test]
    async fn unchanged_reload_does_not_notify() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(Table::Processes, vec![json!({"id": 1, "name": "P"})]);
        let facade: Facade<Process> = Facade::new(db);
        facade.load().await;
        let mut rx = facade.subscribe();
        let _ = rx.borrow_and_update();
        facade.load().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn facades_start_and_shutdown() {
        let db = Arc::new(MemoryBackend::new());
        let mut facades = Facades::new(db.clone(), db.clone());
        let sessions = signed_in();
        facades.start(sessions.subscribe());
        assert!(facades.is_running());
        tokio::time::timeout(Duration::from_secs(2), async {
            while db.subscriber_count() < 7 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        facades.shutdown();
        assert!(!facades.is_running());
        tokio::time::timeout(Duration::from_secs(2), async {
            while db.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
