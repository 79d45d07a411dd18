use std::collections::BTreeMap;
use std::fmt;

use chronostate_common::Value;

use crate::error::SyncError;

/// `(state, payload) -> new state`, or a reason for refusing.
pub type Reducer = Box<dyn Fn(&Value, &Value) -> Result<Value, String> + Send + Sync>;

/// Named reducers. Owned by whoever runs them; there is no global registry.
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: BTreeMap<String, Reducer>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reducer` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, reducer: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.reducers.insert(name.into(), Box::new(reducer));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.reducers.keys().map(String::as_str)
    }

    pub fn run(&self, name: &str, state: &Value, payload: &Value) -> Result<Value, SyncError> {
        let reducer = self
            .reducers
            .get(name)
            .ok_or_else(|| SyncError::UnknownReducer(name.to_owned()))?;
        reducer(state, payload).map_err(|reason| SyncError::Reducer {
            action: name.to_owned(),
            reason,
        })
    }
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.reducers.keys()).finish()
    }
}
