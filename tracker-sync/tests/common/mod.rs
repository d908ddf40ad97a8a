//! In-memory server used by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracker_sync::{
    ImportResult, LocalDatabase, LocalDbConfig, Record, RecordKind, RemoteError, RemoteResource,
    ResourceQuery, ServerClock, Uid,
};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub async fn open_db() -> (Arc<LocalDatabase>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = LocalDbConfig {
        db_path: dir.path().join("tracker.db").to_str().unwrap().to_string(),
        ..LocalDbConfig::default()
    };
    (Arc::new(LocalDatabase::new(config).await.unwrap()), dir)
}

/// Server clock the tests move by hand
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now) })
    }

    pub fn current(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now = *now + Duration::seconds(secs);
    }
}

#[async_trait]
impl ServerClock for FakeClock {
    async fn now(&self) -> Result<DateTime<Utc>, RemoteError> {
        Ok(self.current())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List { kind: String, scope: Option<String> },
    Fetch { kind: String, since: Option<DateTime<Utc>>, scope: Option<String> },
    Create(String),
    Update(String),
    Delete(String),
    FetchOne(String),
}

#[derive(Default)]
struct Collection {
    records: Vec<Record>,
    offline: bool,
    rejections: HashMap<Uid, ImportResult>,
}

/// Shared clock and call log of every fake resource
pub struct FakeServer {
    pub clock: Arc<FakeClock>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeServer {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            clock: FakeClock::at(now),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn resource(&self, kind: &str) -> Arc<FakeResource> {
        Arc::new(FakeResource {
            kind: RecordKind::new(kind),
            clock: self.clock.clone(),
            calls: self.calls.clone(),
            collection: Mutex::new(Collection::default()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Write calls only, as `create:UID` style strings
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create(uid) => Some(format!("create:{}", uid)),
                Call::Update(uid) => Some(format!("update:{}", uid)),
                Call::Delete(uid) => Some(format!("delete:{}", uid)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

pub struct FakeResource {
    kind: RecordKind,
    clock: Arc<FakeClock>,
    calls: Arc<Mutex<Vec<Call>>>,
    collection: Mutex<Collection>,
}

impl FakeResource {
    /// Store a record as if another client had written it
    pub fn put(&self, record: Record) {
        let mut collection = self.collection.lock().unwrap();
        collection.records.retain(|r| r.uid != record.uid);
        collection.records.push(record);
    }

    pub fn remove(&self, uid: &str) {
        self.collection.lock().unwrap().records.retain(|r| r.uid.as_str() != uid);
    }

    pub fn get(&self, uid: &str) -> Option<Record> {
        self.collection
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| r.uid.as_str() == uid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.collection.lock().unwrap().records.len()
    }

    pub fn set_offline(&self, offline: bool) {
        self.collection.lock().unwrap().offline = offline;
    }

    pub fn reject(&self, uid: &str, result: ImportResult) {
        self.collection.lock().unwrap().rejections.insert(Uid::new(uid), result);
    }

    pub fn accept(&self, uid: &str) {
        self.collection.lock().unwrap().rejections.remove(&Uid::new(uid));
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn reachable(&self) -> Result<(), RemoteError> {
        if self.collection.lock().unwrap().offline {
            Err(RemoteError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn matching(&self, query: &ResourceQuery) -> Vec<Record> {
        self.collection
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| query.scope.is_none() || r.scope == query.scope)
            .filter(|r| query.since.map_or(true, |since| r.last_modified > since))
            .cloned()
            .collect()
    }

    fn write(&self, record: &Record) -> ImportResult {
        let mut collection = self.collection.lock().unwrap();
        if let Some(rejection) = collection.rejections.get(&record.uid) {
            return rejection.clone();
        }

        let now = self.clock.current();
        let mut stored = record.clone();
        stored.local_id = None;
        stored.kind = self.kind.clone();
        stored.last_modified = now;
        stored.created = collection
            .records
            .iter()
            .find(|r| r.uid == record.uid)
            .and_then(|r| r.created)
            .or(Some(now));

        collection.records.retain(|r| r.uid != record.uid);
        collection.records.push(stored);
        ImportResult::success()
    }
}

#[async_trait]
impl RemoteResource for FakeResource {
    async fn list_basic(&self, query: &ResourceQuery) -> Result<Vec<Uid>, RemoteError> {
        self.log(Call::List {
            kind: self.kind.to_string(),
            scope: query.scope.clone(),
        });
        self.reachable()?;
        let unbounded = ResourceQuery::new(None, query.scope.as_deref());
        Ok(self.matching(&unbounded).into_iter().map(|r| r.uid).collect())
    }

    async fn fetch_full(&self, query: &ResourceQuery) -> Result<Vec<Record>, RemoteError> {
        self.log(Call::Fetch {
            kind: self.kind.to_string(),
            since: query.since,
            scope: query.scope.clone(),
        });
        self.reachable()?;
        Ok(self.matching(query))
    }

    async fn create(&self, record: &Record) -> Result<ImportResult, RemoteError> {
        self.log(Call::Create(record.uid.to_string()));
        self.reachable()?;
        Ok(self.write(record))
    }

    async fn update(&self, record: &Record) -> Result<ImportResult, RemoteError> {
        self.log(Call::Update(record.uid.to_string()));
        self.reachable()?;
        Ok(self.write(record))
    }

    async fn delete(&self, uid: &Uid) -> Result<ImportResult, RemoteError> {
        self.log(Call::Delete(uid.to_string()));
        self.reachable()?;

        let mut collection = self.collection.lock().unwrap();
        if let Some(rejection) = collection.rejections.get(uid) {
            return Ok(rejection.clone());
        }
        let before = collection.records.len();
        collection.records.retain(|r| &r.uid != uid);
        if collection.records.len() == before {
            return Err(RemoteError::Http {
                status: 404,
                message: format!("{} not found", uid),
            });
        }
        Ok(ImportResult::success())
    }

    async fn fetch_one(&self, uid: &Uid) -> Result<Record, RemoteError> {
        self.log(Call::FetchOne(uid.to_string()));
        self.reachable()?;
        self.collection
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| &r.uid == uid)
            .cloned()
            .ok_or_else(|| RemoteError::Http {
                status: 404,
                message: format!("{} not found", uid),
            })
    }
}
