use crate::query::{JoinPair, Predicate};
use crate::types::{Role, SurveyPoint};
use rand::Rng;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::RwLock;

/// Per-login state. Everything here is transient and disappears with the
/// session on logout.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
    pub role: Role,
    pub regions: Vec<String>,
    pub points: Option<Vec<SurveyPoint>>,
    pub last_query: Option<QueryRecord>,
}

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub predicate: Predicate,
    pub pairs: Vec<JoinPair>,
}

/// In-memory token-keyed session table.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, username: &str, role: Role, regions: Vec<String>) -> String {
        let token = new_token();
        let session = Session {
            username: username.to_string(),
            role,
            regions,
            points: None,
            last_query: None,
        };
        self.inner
            .write()
            .expect("session store lock poisoned")
            .insert(token.clone(), session);
        token
    }

    pub fn close(&self, token: &str) -> bool {
        self.inner
            .write()
            .expect("session store lock poisoned")
            .remove(token)
            .is_some()
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.inner
            .read()
            .expect("session store lock poisoned")
            .get(token)
            .cloned()
    }

    pub fn set_points(&self, token: &str, points: Vec<SurveyPoint>) -> bool {
        let mut guard = self.inner.write().expect("session store lock poisoned");
        match guard.get_mut(token) {
            Some(session) => {
                session.points = Some(points);
                session.last_query = None;
                true
            }
            None => false,
        }
    }

    pub fn set_last_query(&self, token: &str, record: QueryRecord) -> bool {
        let mut guard = self.inner.write().expect("session store lock poisoned");
        match guard.get_mut(token) {
            Some(session) => {
                session.last_query = Some(record);
                true
            }
            None => false,
        }
    }
}

fn new_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let mut token = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(token, "{:02x}", byte);
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Point;
    use std::collections::BTreeMap;

    #[test]
    fn login_logout_lifecycle() {
        let store = SessionStore::new();
        let token = store.open("fanta_emop", Role::User, vec!["Koulikoro".into()]);
        assert_eq!(token.len(), 32);

        let session = store.get(&token).unwrap();
        assert_eq!(session.username, "fanta_emop");
        assert!(session.points.is_none());

        assert!(store.close(&token));
        assert!(store.get(&token).is_none());
        assert!(!store.close(&token));
    }

    #[test]
    fn tokens_are_unique_per_login() {
        let store = SessionStore::new();
        let a = store.open("admin", Role::Admin, vec![]);
        let b = store.open("admin", Role::Admin, vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn uploading_points_resets_the_previous_query() {
        let store = SessionStore::new();
        let token = store.open("admin", Role::Admin, vec![]);

        store.set_last_query(
            &token,
            QueryRecord {
                predicate: Predicate::Within,
                pairs: vec![],
            },
        );
        assert!(store.get(&token).unwrap().last_query.is_some());

        let points = vec![SurveyPoint {
            point: Point::new(-8.0, 12.5),
            attributes: BTreeMap::new(),
        }];
        assert!(store.set_points(&token, points));

        let session = store.get(&token).unwrap();
        assert_eq!(session.points.as_ref().unwrap().len(), 1);
        assert!(session.last_query.is_none());
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let store = SessionStore::new();
        assert!(store.get("deadbeef").is_none());
        assert!(!store.set_points("deadbeef", vec![]));
    }
}
