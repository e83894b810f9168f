//! Persistent backend on a local SQLite database. Watch events are fanned
//! out by this process, so it suits single instance deployments.

use super::{Backend, Event, Item, OpType, Watcher, WatcherSet};
use crate::error::{AuthorityError, AuthorityResult};
use crate::utils::{from_unix_seconds, unix_seconds, Clock};

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use std::sync::{Arc, Mutex, MutexGuard};

diesel::table! {
    backend_items (key) {
        key -> Text,
        value -> Binary,
        expires -> Nullable<BigInt>,
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = backend_items)]
struct Row {
    key: String,
    value: Vec<u8>,
    expires: Option<i64>,
}

impl From<&Item> for Row {
    fn from(item: &Item) -> Self {
        Row {
            key: item.key.clone(),
            value: item.value.clone(),
            expires: item.expires.map(|e| unix_seconds(e) as i64),
        }
    }
}

impl From<Row> for Item {
    fn from(row: Row) -> Self {
        Item {
            key: row.key,
            value: row.value,
            expires: row.expires.map(|e| from_unix_seconds(e.max(0) as u64)),
        }
    }
}

struct State {
    connection: SqliteConnection,
    watchers: WatcherSet,
}

pub struct SqliteBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

fn db_error(e: diesel::result::Error) -> AuthorityError {
    AuthorityError::Backend(format!("sqlite: {}", e))
}

impl SqliteBackend {
    pub fn open(path: &str, clock: Arc<dyn Clock>) -> AuthorityResult<Self> {
        let mut connection = SqliteConnection::establish(path)
            .map_err(|e| AuthorityError::Backend(format!("could not open {}: {}", path, e)))?;
        connection
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS backend_items (
                    key TEXT PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL,
                    expires BIGINT
                );",
            )
            .map_err(db_error)?;
        Ok(Self {
            state: Mutex::new(State {
                connection,
                watchers: WatcherSet::default(),
            }),
            clock,
        })
    }

    fn state(&self) -> AuthorityResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| AuthorityError::Backend(format!("sqlite backend lock poisoned: {}", e)))
    }

    fn live(&self, connection: &mut SqliteConnection, k: &str) -> AuthorityResult<Option<Item>> {
        let row = backend_items::table
            .filter(backend_items::key.eq(k))
            .first::<Row>(connection)
            .optional()
            .map_err(db_error)?;
        let now = self.clock.now();
        Ok(row.map(Item::from).filter(|item| !item.is_expired(now)))
    }

    fn upsert(connection: &mut SqliteConnection, item: &Item) -> AuthorityResult<()> {
        let row = Row::from(item);
        diesel::replace_into(backend_items::table)
            .values(&row)
            .execute(connection)
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&self, key: &str) -> AuthorityResult<Item> {
        let mut state = self.state()?;
        self.live(&mut state.connection, key)?
            .ok_or_else(|| AuthorityError::not_found(format!("key {} is not found", key)))
    }

    async fn get_range(&self, prefix: &str) -> AuthorityResult<Vec<Item>> {
        let mut state = self.state()?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = backend_items::table
            .filter(backend_items::key.like(pattern).escape('\\'))
            .order(backend_items::key.asc())
            .load::<Row>(&mut state.connection)
            .map_err(db_error)?;
        let now = self.clock.now();
        Ok(rows
            .into_iter()
            .map(Item::from)
            .filter(|item| !item.is_expired(now))
            .collect())
    }

    async fn create(&self, item: Item) -> AuthorityResult<()> {
        let mut state = self.state()?;
        if self.live(&mut state.connection, &item.key)?.is_some() {
            return Err(AuthorityError::already_exists(format!(
                "key {} already exists",
                item.key
            )));
        }
        Self::upsert(&mut state.connection, &item)?;
        state.watchers.emit(Event {
            op: OpType::Put,
            item,
        });
        Ok(())
    }

    async fn put(&self, item: Item) -> AuthorityResult<()> {
        let mut state = self.state()?;
        Self::upsert(&mut state.connection, &item)?;
        state.watchers.emit(Event {
            op: OpType::Put,
            item,
        });
        Ok(())
    }

    async fn compare_and_swap(&self, expected: &Item, replace: Item) -> AuthorityResult<()> {
        if expected.key != replace.key {
            return Err(AuthorityError::bad_parameter(
                "expected and replacement keys must match",
            ));
        }
        let mut state = self.state()?;
        match self.live(&mut state.connection, &expected.key)? {
            Some(current) if current.value == expected.value => (),
            Some(_) => {
                return Err(AuthorityError::compare_failed(format!(
                    "key {} was modified concurrently",
                    expected.key
                )))
            }
            None => {
                return Err(AuthorityError::compare_failed(format!(
                    "key {} does not exist",
                    expected.key
                )))
            }
        }
        Self::upsert(&mut state.connection, &replace)?;
        state.watchers.emit(Event {
            op: OpType::Put,
            item: replace,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthorityResult<()> {
        let mut state = self.state()?;
        let existed = self.live(&mut state.connection, key)?.is_some();
        diesel::delete(backend_items::table.filter(backend_items::key.eq(key)))
            .execute(&mut state.connection)
            .map_err(db_error)?;
        if !existed {
            return Err(AuthorityError::not_found(format!("key {} is not found", key)));
        }
        state.watchers.emit(Event {
            op: OpType::Delete,
            item: Item::new(key, vec![]),
        });
        Ok(())
    }

    async fn new_watcher(&self, prefix: &str) -> AuthorityResult<Watcher> {
        let mut state = self.state()?;
        Ok(state.watchers.register(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::system_clock;

    #[tokio::test]
    async fn items_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portcullis.db");
        let path = path.to_str().unwrap();
        {
            let backend = SqliteBackend::open(path, system_clock()).unwrap();
            backend
                .create(Item::new("authorities/user/example.com", b"ca".to_vec()))
                .await
                .unwrap();
        }
        let backend = SqliteBackend::open(path, system_clock()).unwrap();
        let item = backend.get("authorities/user/example.com").await.unwrap();
        assert_eq!(item.value, b"ca".to_vec());
        assert_eq!(backend.get_range("authorities/").await.unwrap().len(), 1);
    }
}
